pub mod access_level;
pub mod acl;

pub use access_level::AccessLevel;
pub use acl::{merge_and_sanitize, AclAllow, AclEntry, AclTarget};
