use super::access_level::AccessLevel;
use serde::{Deserialize, Serialize};

/// Who an ACL entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AclTarget {
    /// A specific account, or the public/anonymous identifiers.
    Account,
    Role,
    /// The account document being accessed by its own principal.
    #[serde(rename = "self")]
    SelfAccess,
    Creator,
    Owner,
}

/// What an ACL entry grants: a level, or membership in a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AclAllow {
    Level(AccessLevel),
    Role(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclEntry {
    #[serde(rename = "type")]
    pub kind: AclTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub allow: AclAllow,
}

impl AclEntry {
    pub fn account<S: Into<String>>(target: S, level: AccessLevel) -> Self {
        Self {
            kind: AclTarget::Account,
            target: Some(target.into()),
            allow: AclAllow::Level(level),
        }
    }

    pub fn role<S: Into<String>>(target: S, level: AccessLevel) -> Self {
        Self {
            kind: AclTarget::Role,
            target: Some(target.into()),
            allow: AclAllow::Level(level),
        }
    }

    pub fn owner(level: AccessLevel) -> Self {
        Self {
            kind: AclTarget::Owner,
            target: None,
            allow: AclAllow::Level(level),
        }
    }

    pub fn creator(level: AccessLevel) -> Self {
        Self {
            kind: AclTarget::Creator,
            target: None,
            allow: AclAllow::Level(level),
        }
    }

    /// Entries naming a concrete account or role. `self`, `creator` and
    /// `owner` entries only make sense against a loaded document.
    pub fn is_targeted(&self) -> bool {
        matches!(self.kind, AclTarget::Account | AclTarget::Role) && self.target.is_some()
    }

    pub fn level(&self) -> Option<AccessLevel> {
        match &self.allow {
            AclAllow::Level(level) => Some(*level),
            AclAllow::Role(_) => None,
        }
    }
}

/// Merge entry lists. Level entries for the same target combine by max,
/// entries allowing nothing are dropped, first-seen order is kept.
pub fn merge_and_sanitize(lists: &[&[AclEntry]]) -> Vec<AclEntry> {
    let mut merged: Vec<AclEntry> = Vec::new();
    for entry in lists.iter().flat_map(|list| list.iter()) {
        match &entry.allow {
            AclAllow::Level(level) => {
                if *level == AccessLevel::None {
                    continue;
                }
                let existing = merged.iter_mut().find(|candidate| {
                    candidate.kind == entry.kind
                        && candidate.target == entry.target
                        && candidate.level().is_some()
                });
                match existing {
                    Some(candidate) => {
                        if let AclAllow::Level(current) = &mut candidate.allow {
                            *current = (*current).max(*level);
                        }
                    }
                    None => merged.push(entry.clone()),
                }
            }
            AclAllow::Role(_) => {
                if !merged.contains(entry) {
                    merged.push(entry.clone());
                }
            }
        }
    }
    merged
}
