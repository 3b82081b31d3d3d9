/// Audit trail for render coordination
///
/// Every admission decision, lock transition and render result becomes one
/// JSON event. Events always go to the `renderbox::audit` log target and,
/// when configured, are appended as JSON lines to an events file.
use crate::config::types::{RenderboxError, ResourceKey, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "renderbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AssetAccepted,
    AssetRejected,
    RenderStarted,
    RenderFinished,
    RenderBusy,
    LocksReaped,
    MirrorFetched,
    MirrorFailed,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::AssetRejected => AuditSeverity::High,
            AuditEventType::RenderBusy
            | AuditEventType::LocksReaped
            | AuditEventType::MirrorFailed => AuditSeverity::Medium,
            _ => AuditSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub details: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ResourceKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity: event_type.default_severity(),
            event_type,
            details: details.into(),
            pid: std::process::id(),
            key: None,
            job_id: None,
            file_path: None,
        }
    }

    pub fn with_key(mut self, key: &ResourceKey) -> Self {
        self.key = Some(key.clone());
        self
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_file_path(mut self, path: &Path) -> Self {
        self.file_path = Some(path.to_path_buf());
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Sink for audit events
pub struct AuditLog {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Log-only audit trail
    pub fn disabled() -> Self {
        Self {
            file: None,
            path: None,
        }
    }

    /// Open (or create) the events file in append mode
    pub fn new(events_file: Option<PathBuf>) -> Result<Self> {
        let Some(path) = events_file else {
            return Ok(Self::disabled());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RenderboxError::Config(format!("Failed to create audit directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RenderboxError::Config(format!("Failed to open audit events file: {}", e)))?;

        Ok(Self {
            file: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                log::error!(target: AUDIT_TARGET, "Failed to serialize audit event: {}", e);
                return;
            }
        };

        match event.severity {
            AuditSeverity::High => log::warn!(target: AUDIT_TARGET, "{}", line),
            AuditSeverity::Medium | AuditSeverity::Low => log::info!(target: AUDIT_TARGET, "{}", line),
        }

        if let Some(file) = &self.file {
            let mut file = match file.lock() {
                Ok(file) => file,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = writeln!(file, "{}", line) {
                log::error!(target: AUDIT_TARGET, "Failed to write audit event: {}", e);
            }
        }
    }
}
