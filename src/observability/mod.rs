//! Observability
//!
//! Structured audit events and metrics for operational visibility.

pub mod audit;
pub mod metrics;

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditSeverity};
pub use metrics::RenderMetrics;
