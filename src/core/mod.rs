//! Render job coordination core.
//!
//! Asset storage layout and the coordinator that ties validation, locking
//! and renderer supervision together.

pub mod coordinator;
pub mod store;

pub use coordinator::{IngestResult, JobCoordinator, RenderReport, ResourceStatus};
pub use store::{AssetStore, StoredResource};
