/// Configuration loading from renderbox.json
use crate::config::types::{ReapPolicy, RenderboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default working directory, matching the container layout
pub const DEFAULT_WORK_DIR: &str = "/workspace";

/// Full renderbox.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderboxConfig {
    pub paths: PathsConfig,
    pub renderer: RendererConfig,
    pub validation: ValidationConfig,
    pub locks: LocksConfig,
    pub mirror: MirrorConfig,
    pub audit: AuditConfig,
}

/// Directory layout. Unset directories are derived from `work_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub work_dir: PathBuf,
    pub upload_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
    pub incoming_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            upload_dir: None,
            output_dir: None,
            lock_dir: None,
            incoming_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("uploads"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("output"))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("locks"))
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.incoming_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("incoming"))
    }
}

/// External renderer invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub binary: PathBuf,
    /// Wall-clock deadline per render
    pub deadline_secs: u64,
    /// Render engine passed with `-E` (e.g. CYCLES)
    pub engine: Option<String>,
    /// Cycles compute device passed after `--` (e.g. CUDA, OPTIX)
    pub cycles_device: Option<String>,
    /// Output format passed with `-F`
    pub output_format: String,
    /// File extension of the produced artifact
    pub artifact_extension: String,
    /// Extra arguments inserted before the output/frame arguments
    pub extra_args: Vec<String>,
    /// A line containing any of these marks the render as failed
    pub error_markers: Vec<String>,
    /// Time between SIGTERM and SIGKILL when the deadline expires
    pub kill_grace_ms: u64,
    /// Cap on captured renderer output
    pub output_limit_bytes: usize,
    /// How long to wait for the output pipe to drain after exit
    pub collection_timeout_ms: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("blender"),
            deadline_secs: 600,
            engine: None,
            cycles_device: None,
            output_format: "PNG".to_string(),
            artifact_extension: "png".to_string(),
            extra_args: Vec::new(),
            error_markers: vec!["Error:".to_string()],
            kill_grace_ms: 2000,
            output_limit_bytes: 4 * 1024 * 1024,
            collection_timeout_ms: 5000,
        }
    }
}

impl RendererConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(self.collection_timeout_ms)
    }
}

/// Upload screening
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Required leading bytes of every asset
    pub magic: String,
    pub max_asset_bytes: u64,
    /// Byte patterns associated with code execution primitives
    pub banned_patterns: Vec<String>,
    /// Advisory only; the signature check is authoritative
    pub allowed_extensions: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            magic: "BLENDER".to_string(),
            max_asset_bytes: 512 * 1024 * 1024,
            banned_patterns: [
                "subprocess",
                "os.system",
                "os.popen",
                "os.exec",
                "import os",
                "__import__",
                "eval(",
                "exec(",
                "shutil",
                "ctypes",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            allowed_extensions: vec!["blend".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub reap_policy: ReapPolicy,
    /// Lease written into each marker; only consulted by the `expired` policy
    pub lease_ttl_secs: Option<u64>,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            reap_policy: ReapPolicy::Unconditional,
            lease_ttl_secs: Some(3600),
        }
    }
}

impl LocksConfig {
    pub fn lease_ttl(&self) -> Option<Duration> {
        self.lease_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append structured events to this JSONL file
    pub events_file: Option<PathBuf>,
}

impl RenderboxConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RenderboxError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| RenderboxError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| RenderboxError::Config(e.to_string()))
    }

    /// Defaults rooted at `work_dir`
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.paths.work_dir = work_dir.into();
        config
    }
}
