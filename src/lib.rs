//! # objectfold
//!
//! The data-access core of a multi-tenant object platform: typed object
//! models with polymorphic variants, access-controlled projection of query
//! pipelines, and batch mutations with partial-failure reporting.
//!
//! ## Core Components
//!
//! * `schema` - Model compilation, type variants, discriminated sets, reads,
//!   writes and validation
//! * `permissions` - Access levels, ACL entries, principals and access contexts
//! * `projection` - Pipeline stage resolution and access-checked result serving
//! * `mutation` - Create, update, patch and delete orchestration
//! * `store` - The document store interface and the reaper/script collaborators
//! * `config` - TOML configuration with environment overrides
//! * `logging` - `env_logger` setup
//! * `reporting` - Injected metrics sinks
//!
//! ## Architecture
//!
//! Model definitions compile once into immutable [`schema::TypedModel`]
//! arenas shared across requests. Every read and write goes through a
//! per-operation [`permissions::AccessContext`]. Persistence, scripting and
//! deferred deletion are traits supplied by the host.

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod permissions;
pub mod projection;
pub mod reporting;
pub mod schema;
pub mod store;
pub mod utils;

// Re-export main types for convenience
pub use config::{ConfigError, MutationConfig, ObjectConfig, QueryConfig};
pub use error::{Fault, FaultCategory, FaultResult};
pub use mutation::{MutationOptions, MutationOrchestrator, MutationResult};
pub use permissions::{AccessContext, AccessLevel, AccessOptions, AclEntry, Principal};
pub use projection::{ProjectionPlan, ProjectionResolver};
pub use reporting::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use schema::{ModelCompiler, ModelDefinition, SchemaRegistry, TypedModel};
pub use store::{DocumentStore, InMemoryDocumentStore};
