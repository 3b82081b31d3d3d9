//! Remote asset mirror
//!
//! Abstract source of render inputs plus a bounded background fetch queue.
//! Fetched files land in the incoming directory and still go through the
//! normal upload validation before they can be rendered.

pub mod local;
pub mod queue;

use crate::config::types::MirrorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use local::LocalDirMirror;
pub use queue::{FetchRecord, FetchStatus, FetchTicket, MirrorQueue};

pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

/// Asset as advertised by a mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Source of render inputs outside the coordinator
pub trait AssetMirror: Send + Sync {
    fn list(&self) -> MirrorResult<Vec<RemoteAsset>>;

    /// Download `id` into `dest_dir`, returning the local path
    fn fetch(&self, id: &str, dest_dir: &Path) -> MirrorResult<PathBuf>;
}
