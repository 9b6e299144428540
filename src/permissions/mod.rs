// permissions module

pub mod access_context;
pub mod principal;
pub mod types;

pub use access_context::{AccessContext, AccessMethod, AccessOptions, ScriptBudget, SubjectIdentity};
pub use principal::{Org, OrgConfiguration, Principal};
pub use types::{merge_and_sanitize, AccessLevel, AclAllow, AclEntry, AclTarget};
