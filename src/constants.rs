/// Common constants used across the object-data layer.
///
/// Limits here are defaults; `ObjectConfig` and per-org configuration
/// override them at runtime.
pub const PUBLIC_IDENTIFIER: &str = "000000000000000000000003";
pub const ANONYMOUS_IDENTIFIER: &str = "000000000000000000000001";

/// Object name whose documents are principals themselves (enables `self` ACL entries).
pub const ACCOUNT_OBJECT: &str = "account";

pub const DEFAULT_DISCRIMINATOR_KEY: &str = "name";
pub const DEFAULT_OBJECT_MODE: &str = "crud";

pub const DEFAULT_CREATE_CONCURRENCY: usize = 50;
pub const DEFAULT_MAX_SEQUENCE_RETRIES: usize = 10;
pub const DEFAULT_MAX_UPDATES_PER_CALL: usize = 1000;
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_WRITE_ERRORS: usize = 1000;
pub const DEFAULT_MIN_SCRIPT_TIME_LEFT_MS: u64 = 250;
pub const DEFAULT_RETRY_JITTER_MS: u64 = 8;
pub const DEFAULT_MAX_MANAGED_INSERTS: usize = 1000;
pub const DEFAULT_MAX_UNMANAGED_INSERTS: usize = 1000;

/// Context option overlays read by nested writers.
pub const DEFAULT_ACL_OPTION: &str = "$defaultAcl";
pub const CREATE_ACL_OPTION: &str = "$createAcl";
pub const SET_VERSION_OPTION: &str = "$setVersion";

/// Output names a projection may never produce.
pub const RESERVED_PROJECTION_NAMES: &[&str] = &["acl", "aclv", "sequence", "reap", "meta", "idx"];

/// Collections touched by the delete cleanup fan-out.
pub const HISTORY_COLLECTION: &str = "history";
pub const POST_COLLECTION: &str = "post";
pub const COMMENT_COLLECTION: &str = "comment";
pub const NOTIFICATION_COLLECTION: &str = "notification";
pub const CONNECTION_COLLECTION: &str = "connection";
