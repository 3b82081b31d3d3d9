/// Core types and structures shared across renderbox
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Maximum length of a resource key in bytes
pub const MAX_KEY_LEN: usize = 128;

/// Canonical identity of a renderable asset.
///
/// Derived from the stable file stem of an uploaded asset and used to
/// index lock markers, stored inputs and output artifacts. Only
/// `[A-Za-z0-9._-]` is allowed and the key may not start with a dot, so a
/// key can always be joined onto a directory without escaping it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Parse an already-canonical key
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(RenderboxError::InvalidKey {
                key: raw.to_string(),
                reason: "key is empty".to_string(),
            });
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(RenderboxError::InvalidKey {
                key: raw.to_string(),
                reason: format!("key longer than {} bytes", MAX_KEY_LEN),
            });
        }
        if raw.starts_with('.') {
            return Err(RenderboxError::InvalidKey {
                key: raw.to_string(),
                reason: "key may not start with '.'".to_string(),
            });
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(RenderboxError::InvalidKey {
                key: raw.to_string(),
                reason: format!("character {:?} is not allowed", bad),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = RenderboxError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> String {
        key.0
    }
}

/// A stored asset that can be rendered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderResource {
    pub key: ResourceKey,
    /// Input asset handed to the renderer
    pub input_path: PathBuf,
    /// Output prefix passed to the renderer (`-o`)
    pub output_prefix: PathBuf,
    /// Artifact the renderer must leave behind for a successful render
    pub artifact_path: PathBuf,
}

/// Raw upload as handed over by the transport layer
#[derive(Clone, Debug)]
pub struct AssetUpload {
    /// Client-supplied file name, untrusted
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl AssetUpload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// Asset that passed validation and was persisted
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptedAsset {
    pub key: ResourceKey,
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-256 of the stored bytes
    pub sha256: String,
}

/// Verdict of a single validation check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckVerdict {
    Pass,
    Reject(ValidationError),
}

impl CheckVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, CheckVerdict::Pass)
    }
}

/// Result of screening one uploaded asset
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationReport {
    pub signature: CheckVerdict,
    pub size: CheckVerdict,
    pub content: CheckVerdict,
}

impl ValidationReport {
    /// PASS only if every sub-check passed
    pub fn is_pass(&self) -> bool {
        self.signature.is_pass() && self.size.is_pass() && self.content.is_pass()
    }

    /// First failing check, in signature, size, content order
    pub fn rejection(&self) -> Option<&ValidationError> {
        [&self.signature, &self.size, &self.content]
            .into_iter()
            .find_map(|verdict| match verdict {
                CheckVerdict::Pass => None,
                CheckVerdict::Reject(err) => Some(err),
            })
    }

    /// Human-readable reason for a REJECT
    pub fn reason(&self) -> Option<String> {
        self.rejection().map(|err| err.to_string())
    }

    pub fn into_result(self) -> std::result::Result<(), ValidationError> {
        match self.rejection() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Why a render did not produce a usable artifact
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderError {
    #[error("renderer exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("renderer killed by signal {signal}")]
    Signaled { signal: i32 },

    #[error("renderer reported errors in its output")]
    ErrorMarkerInOutput,

    #[error("render exceeded deadline of {deadline:?}")]
    Timeout { deadline: Duration },

    #[error("renderer finished but artifact {path} is missing")]
    MissingArtifact { path: PathBuf },
}

impl RenderError {
    /// Stable label used for metrics and audit events
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::NonZeroExit { .. } => "non_zero_exit",
            RenderError::Signaled { .. } => "signaled",
            RenderError::ErrorMarkerInOutput => "error_marker",
            RenderError::Timeout { .. } => "timeout",
            RenderError::MissingArtifact { .. } => "missing_artifact",
        }
    }
}

/// Failed render with the diagnostic excerpt shown to the caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderFailure {
    pub error: RenderError,
    /// Output lines carrying an error marker, or a generic hint
    pub excerpt: String,
}

/// Final classification of one render attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderOutcome {
    Done(PathBuf),
    Failed(RenderFailure),
}

impl RenderOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, RenderOutcome::Done(_))
    }

    pub fn artifact(&self) -> Option<&PathBuf> {
        match self {
            RenderOutcome::Done(path) => Some(path),
            RenderOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RenderFailure> {
        match self {
            RenderOutcome::Done(_) => None,
            RenderOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// Per-request lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Validating,
    Locked,
    Rendering,
    Done,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Validating => "validating",
            JobState::Locked => "locked",
            JobState::Rendering => "rendering",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the startup reaper treats leftover lock markers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReapPolicy {
    /// Remove every marker (single-instance deployments)
    #[default]
    Unconditional,
    /// Remove only markers whose lease expired or whose owner is gone
    Expired,
}

/// Content of a lock marker file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub key: ResourceKey,
    pub pid: u32,
    pub instance_id: String,
    /// Unique per acquisition, so a late release cannot remove a newer marker
    pub token: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub renderbox_version: String,
}

/// Validation failures. The asset is discarded and no lock is taken.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("bad signature: expected prefix {expected:?}, found {found:?}")]
    BadSignature { expected: String, found: String },

    #[error("asset too large: {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("suspicious content: matched pattern {pattern:?}")]
    SuspiciousContent { pattern: String },
}

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("resource {key} is busy (owned by PID {owner_pid:?})")]
    Busy { key: ResourceKey, owner_pid: Option<u32> },

    #[error("another coordinator instance holds {path}")]
    InstanceActive { path: PathBuf },

    #[error("lock corruption detected for {path}: {details}")]
    CorruptedLock { path: PathBuf, details: String },

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Mirror and fetch queue errors
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("fetch queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("fetch queue has shut down")]
    ShutDown,

    #[error("remote asset {id} not found")]
    UnknownAsset { id: String },

    #[error("mirror error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RenderboxError {
    #[error("validation rejected asset: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Lock(#[from] LockError),

    #[error("resource {key} not found")]
    NotFound { key: ResourceKey },

    #[error("invalid resource key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Mirror(#[from] MirrorError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RenderboxError {
    /// True when the request was turned away because the resource is in use
    pub fn is_busy(&self) -> bool {
        matches!(self, RenderboxError::Lock(LockError::Busy { .. }))
    }
}

/// Convert errors to process exit codes for the CLI
impl From<&RenderboxError> for i32 {
    fn from(err: &RenderboxError) -> i32 {
        match err {
            RenderboxError::Lock(LockError::Busy { .. }) => 2, // Temporary failure
            RenderboxError::Lock(LockError::InstanceActive { .. }) => 75,
            RenderboxError::Lock(LockError::CorruptedLock { .. }) => 75,
            RenderboxError::Lock(LockError::Io(_)) => 74,
            RenderboxError::Validation(_) => 65, // Data error
            RenderboxError::NotFound { .. } => 66,
            RenderboxError::InvalidKey { .. } => 64,
            RenderboxError::Io(_) => 74,
            RenderboxError::Config(_) => 78,
            RenderboxError::Mirror(_) => 69,
            RenderboxError::Serialization(_) => 65,
        }
    }
}

/// Exit code for a render that ran but failed
impl From<&RenderError> for i32 {
    fn from(err: &RenderError) -> i32 {
        match err {
            RenderError::Timeout { .. } => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderboxError>;
