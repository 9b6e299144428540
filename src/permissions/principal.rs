//! Resolved caller identity.

use super::types::AccessLevel;
use crate::constants::{
    ANONYMOUS_IDENTIFIER, DEFAULT_MAX_MANAGED_INSERTS, DEFAULT_MAX_UNMANAGED_INSERTS,
    DEFAULT_OBJECT_MODE,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-tenant object settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgConfiguration {
    /// Letters from `crud`; a missing letter disables that operation on
    /// models that obey the object mode.
    pub object_mode: String,
    pub max_managed_inserts: usize,
    pub max_unmanaged_inserts: usize,
}

impl Default for OrgConfiguration {
    fn default() -> Self {
        Self {
            object_mode: DEFAULT_OBJECT_MODE.to_string(),
            max_managed_inserts: DEFAULT_MAX_MANAGED_INSERTS,
            max_unmanaged_inserts: DEFAULT_MAX_UNMANAGED_INSERTS,
        }
    }
}

impl OrgConfiguration {
    pub fn allows(&self, mode: char) -> bool {
        self.object_mode.contains(mode)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Org {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub configuration: OrgConfiguration,
}

/// A caller with its role memberships and scopes already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub org: Arc<Org>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Level granted to this principal regardless of ACLs.
    #[serde(default)]
    pub grant: AccessLevel,
    #[serde(default)]
    pub bypass_create_acl: bool,
}

impl Principal {
    pub fn new<S: Into<String>>(id: S, org: Arc<Org>) -> Self {
        Self {
            id: id.into(),
            org,
            roles: Vec::new(),
            scopes: vec!["*".to_string()],
            grant: AccessLevel::None,
            bypass_create_acl: false,
        }
    }

    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_grant(mut self, grant: AccessLevel) -> Self {
        self.grant = grant;
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.id == ANONYMOUS_IDENTIFIER
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Whether a granted scope covers `required`.
    ///
    /// Scopes are dot separated; `*` matches any segment and a shorter grant
    /// covers everything beneath it. A grant on `object.create.c_post` covers
    /// `object.create.c_post#video`. With `accept_prefix`, a grant more
    /// specific than `required` also counts (instance-level scopes).
    pub fn in_scope(&self, required: &str, accept_prefix: bool) -> bool {
        self.scopes.iter().any(|granted| {
            scope_covers(granted, required) || (accept_prefix && scope_covers(required, granted))
        })
    }
}

fn scope_covers(granted: &str, required: &str) -> bool {
    let granted: Vec<&str> = granted.split('.').collect();
    let required: Vec<&str> = required.split('.').collect();
    if granted.len() > required.len() {
        return false;
    }
    granted.iter().zip(required.iter()).all(|(g, r)| {
        *g == "*" || g == r || r.split('#').next().map_or(false, |base| base == *g)
    })
}
