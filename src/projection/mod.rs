//! Pipeline projection: which schema nodes produce each output, and
//! access-checked reads of results.

pub mod expression;
pub mod projected;
pub mod resolver;
pub mod serve;

pub use expression::{ProjectionExpr, StageKind};
pub use projected::{Projected, ProjectedDocument, ProjectedNode, SourceRef};
pub use resolver::ProjectionResolver;
pub use serve::ProjectionPlan;
