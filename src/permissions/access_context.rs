//! Per-operation access state.
//!
//! An [`AccessContext`] is built for one principal acting on one object (and,
//! once a document is known, one subject). Its natural level comes from
//! merging the subject's ACL with the model's default ACL; grants and
//! overrides are applied on top. Contexts are never shared across documents.

use super::principal::Principal;
use super::types::{merge_and_sanitize, AccessLevel, AclAllow, AclEntry, AclTarget};
use crate::constants::{ACCOUNT_OBJECT, ANONYMOUS_IDENTIFIER, PUBLIC_IDENTIFIER};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The operation the context was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

/// Remaining execution time when running inside a script.
#[derive(Debug, Clone, Copy)]
pub struct ScriptBudget {
    deadline: Instant,
}

impl ScriptBudget {
    pub fn new(time_left: Duration) -> Self {
        Self {
            deadline: Instant::now() + time_left,
        }
    }

    pub fn time_left(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Caller supplied knobs for building a context.
#[derive(Debug, Clone, Default)]
pub struct AccessOptions {
    pub method: AccessMethod,
    pub grant: Option<AccessLevel>,
    pub override_level: Option<AccessLevel>,
    pub roles: Vec<String>,
    pub dry_run: bool,
    pub scoped: bool,
    pub script: Option<ScriptBudget>,
    pub req_id: Option<String>,
}

/// Identity fields pulled from a subject document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectIdentity {
    pub id: Option<String>,
    pub owner: Option<String>,
    pub creator: Option<String>,
    pub type_name: Option<String>,
    pub acl: Vec<AclEntry>,
}

impl SubjectIdentity {
    pub fn from_document(document: &Value) -> Self {
        let nested_id = |key: &str| {
            document
                .get(key)
                .and_then(|v| v.get("_id").or(Some(v)))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            id: document.get("_id").and_then(Value::as_str).map(str::to_string),
            owner: nested_id("owner"),
            creator: nested_id("creator"),
            type_name: document.get("type").and_then(Value::as_str).map(str::to_string),
            acl: document
                .get("acl")
                .cloned()
                .and_then(|acl| serde_json::from_value(acl).ok())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessContext {
    principal: Arc<Principal>,
    object_name: String,
    subject: Option<SubjectIdentity>,
    method: AccessMethod,
    natural: AccessLevel,
    roles: Vec<String>,
    grant: AccessLevel,
    override_level: Option<AccessLevel>,
    dry_run: bool,
    scoped: bool,
    script: Option<ScriptBudget>,
    req_id: Option<String>,
    index: Option<usize>,
    options: HashMap<String, Value>,
}

impl AccessContext {
    pub fn new<S: Into<String>>(principal: Arc<Principal>, object_name: S, options: &AccessOptions) -> Self {
        let grant = options.grant.unwrap_or_default().max(principal.grant);
        Self {
            principal,
            object_name: object_name.into(),
            subject: None,
            method: options.method,
            natural: AccessLevel::None,
            roles: options.roles.clone(),
            grant,
            override_level: options.override_level,
            dry_run: options.dry_run,
            scoped: options.scoped,
            script: options.script,
            req_id: options.req_id.clone(),
            index: None,
            options: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_subject(mut self, document: &Value) -> Self {
        self.set_subject(document);
        self
    }

    pub fn set_subject(&mut self, document: &Value) {
        self.subject = Some(SubjectIdentity::from_document(document));
    }

    /// Resolve the natural level against `subject ACL ⊕ default_acl`.
    pub fn resolve(&mut self, default_acl: &[AclEntry]) -> AccessLevel {
        let subject_acl = self.subject.as_ref().map(|s| s.acl.clone()).unwrap_or_default();
        let merged = merge_and_sanitize(&[default_acl, subject_acl.as_slice()]);
        self.collect_roles(&merged);
        self.natural = self.resolve_access(&merged);
        self.resolved()
    }

    /// Natural level an arbitrary ACL yields for this principal and subject.
    pub fn resolve_access(&self, acl: &[AclEntry]) -> AccessLevel {
        acl.iter()
            .filter(|entry| self.entry_applies(entry))
            .filter_map(AclEntry::level)
            .fold(AccessLevel::None, AccessLevel::max)
    }

    /// Like [`Self::resolve_access`] but including grants and override.
    pub fn resolve_with_grants(&self, acl: &[AclEntry]) -> AccessLevel {
        match self.override_level {
            Some(level) => level,
            None => self.grant.max(self.resolve_access(acl)),
        }
    }

    pub fn resolved(&self) -> AccessLevel {
        match self.override_level {
            Some(level) => level,
            None => self.grant.max(self.natural),
        }
    }

    pub fn has_access(&self, level: AccessLevel) -> bool {
        self.resolved() >= level
    }

    /// Whether the create ACL lets this principal create instances at all.
    pub fn can_create(&self, create_acl: &[AclEntry]) -> bool {
        if self.principal.bypass_create_acl {
            return true;
        }
        self.resolve_access(create_acl) >= AccessLevel::MIN
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role) || self.principal.has_role(role)
    }

    fn collect_roles(&mut self, acl: &[AclEntry]) {
        for entry in acl {
            if let AclAllow::Role(role) = &entry.allow {
                if self.entry_applies(entry) && !self.roles.contains(role) {
                    self.roles.push(role.clone());
                }
            }
        }
    }

    fn entry_applies(&self, entry: &AclEntry) -> bool {
        let principal = &self.principal;
        let subject = self.subject.as_ref();
        match entry.kind {
            AclTarget::Account => match entry.target.as_deref() {
                Some(ANONYMOUS_IDENTIFIER) => true,
                Some(PUBLIC_IDENTIFIER) => !principal.is_anonymous(),
                Some(target) => target == principal.id,
                None => false,
            },
            AclTarget::Role => entry.target.as_deref().map_or(false, |role| self.has_role(role)),
            AclTarget::SelfAccess => {
                self.object_name == ACCOUNT_OBJECT
                    && subject.and_then(|s| s.id.as_deref()) == Some(principal.id.as_str())
            }
            AclTarget::Creator => subject.and_then(|s| s.creator.as_deref()) == Some(principal.id.as_str()),
            AclTarget::Owner => subject.and_then(|s| s.owner.as_deref()) == Some(principal.id.as_str()),
        }
    }

    pub fn principal(&self) -> &Arc<Principal> {
        &self.principal
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn subject(&self) -> Option<&SubjectIdentity> {
        self.subject.as_ref()
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.subject.as_ref().and_then(|s| s.id.as_deref())
    }

    pub fn method(&self) -> AccessMethod {
        self.method
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn is_scoped(&self) -> bool {
        self.scoped
    }

    pub fn script(&self) -> Option<&ScriptBudget> {
        self.script.as_ref()
    }

    pub fn req_id(&self) -> Option<&str> {
        self.req_id.as_deref()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = Some(index);
    }

    /// Option bag shared with nested writers (`$defaultAcl`, `$setVersion`, ...).
    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn set_option<S: Into<String>>(&mut self, key: S, value: Value) {
        self.options.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::principal::{Org, OrgConfiguration};
    use serde_json::json;

    fn principal(id: &str) -> Arc<Principal> {
        let org = Arc::new(Org {
            id: "org".to_string(),
            code: "test".to_string(),
            configuration: OrgConfiguration::default(),
        });
        Arc::new(Principal::new(id, org).with_roles(["editors"]))
    }

    #[test]
    fn owner_entry_resolves_against_subject() {
        let doc = json!({"_id": "d1", "owner": {"_id": "p1"}, "creator": {"_id": "p2"}});
        let mut ac = AccessContext::new(principal("p1"), "c_post", &AccessOptions::default()).with_subject(&doc);
        let level = ac.resolve(&[AclEntry::owner(AccessLevel::Delete), AclEntry::creator(AccessLevel::Read)]);
        assert_eq!(level, AccessLevel::Delete);

        let mut other = AccessContext::new(principal("p2"), "c_post", &AccessOptions::default()).with_subject(&doc);
        assert_eq!(
            other.resolve(&[AclEntry::owner(AccessLevel::Delete), AclEntry::creator(AccessLevel::Read)]),
            AccessLevel::Read
        );
    }

    #[test]
    fn subject_acl_merges_with_default() {
        let doc = json!({"_id": "d1", "acl": [{"type": "role", "target": "editors", "allow": "update"}]});
        let mut ac = AccessContext::new(principal("p3"), "c_post", &AccessOptions::default()).with_subject(&doc);
        assert_eq!(ac.resolve(&[AclEntry::account(PUBLIC_IDENTIFIER, AccessLevel::Read)]), AccessLevel::Update);
    }

    #[test]
    fn role_allow_adds_role_before_levels() {
        let acl = vec![
            AclEntry {
                kind: AclTarget::Account,
                target: Some("p4".to_string()),
                allow: AclAllow::Role("reviewers".to_string()),
            },
            AclEntry::role("reviewers", AccessLevel::Share),
        ];
        let mut ac = AccessContext::new(principal("p4"), "c_post", &AccessOptions::default());
        assert_eq!(ac.resolve(&acl), AccessLevel::Share);
        assert!(ac.has_role("reviewers"));
    }

    #[test]
    fn override_wins_over_grant() {
        let options = AccessOptions {
            grant: Some(AccessLevel::Update),
            ..AccessOptions::default()
        };
        let mut ac = AccessContext::new(principal("p1"), "c_post", &options);
        assert_eq!(ac.resolve(&[]), AccessLevel::Update);

        let options = AccessOptions {
            grant: Some(AccessLevel::Update),
            override_level: Some(AccessLevel::Read),
            ..AccessOptions::default()
        };
        let ac = AccessContext::new(principal("p1"), "c_post", &options);
        assert_eq!(ac.resolved(), AccessLevel::Read);
    }

    #[test]
    fn self_entry_only_on_accounts() {
        let doc = json!({"_id": "p1"});
        let acl = vec![AclEntry {
            kind: AclTarget::SelfAccess,
            target: None,
            allow: AclAllow::Level(AccessLevel::Update),
        }];
        let mut account = AccessContext::new(principal("p1"), ACCOUNT_OBJECT, &AccessOptions::default()).with_subject(&doc);
        assert_eq!(account.resolve(&acl), AccessLevel::Update);
        let mut post = AccessContext::new(principal("p1"), "c_post", &AccessOptions::default()).with_subject(&doc);
        assert_eq!(post.resolve(&acl), AccessLevel::None);
    }

    #[test]
    fn create_acl_requires_min() {
        let ac = AccessContext::new(principal("p1"), "c_post", &AccessOptions::default());
        assert!(ac.can_create(&[AclEntry::account(PUBLIC_IDENTIFIER, AccessLevel::MIN)]));
        assert!(!ac.can_create(&[AclEntry::account("someone", AccessLevel::MIN)]));
    }
}
