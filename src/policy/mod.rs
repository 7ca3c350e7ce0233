//! Snapshot indexing and the decision procedure over it.

pub mod evaluator;
pub mod index;
pub mod store;

pub use evaluator::evaluate;
pub use index::{GrantRejection, IndexBuildReport, IndexedGrant, MatchRank, PermissionIndex};
pub use store::{parse_policy, FileGrantStore, GrantStore, LoadedPolicy};
