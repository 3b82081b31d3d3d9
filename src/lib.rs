//! renderbox: coordination layer for a scarce batch renderer
//!
//! Exposes one external renderer (Blender in production) to many concurrent
//! requesters: untrusted uploads are screened before they are stored, each
//! stored scene renders at most once at a time, and crashed or hung renders
//! never strand a scene.
//!
//! # Architecture
//!
//! ## Coordination ([`core`])
//! - [`core::coordinator`]: `submit` / `render` entry points and job lifecycle
//! - [`core::store`]: Upload and artifact directory layout
//!
//! ## Admission ([`security`])
//! - [`security::validator`]: Signature, size and content screening
//! - [`security::filename`]: Upload name hygiene and resource keys
//!
//! ## Safety & Recovery ([`safety`])
//! - [`safety::lock_manager`]: Exclusive-create lock markers with RAII release
//! - [`safety::reaper`]: Startup sweep of stale markers
//!
//! ## Execution ([`exec`]) and Verdict ([`verdict`])
//! - [`exec::command`]: Renderer command line
//! - [`exec::supervisor`]: Process group, deadline, merged output capture
//! - [`verdict::classify`]: Done/Failed decision from the collected evidence
//!
//! ## Mirror ([`mirror`])
//! - [`mirror::queue`]: Bounded background fetch queue
//! - [`mirror::local`]: Directory-backed mirror
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: renderbox.json loading and defaults
//! - [`config::validator`]: Startup configuration checks
//! - [`config::types`]: Shared types and error enums

// Coordination
pub mod core;

// Admission
pub mod security;

// Safety & Recovery
pub mod safety;

// Execution
pub mod exec;

// Outcome classification
pub mod verdict;

// Remote asset mirror
pub mod mirror;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint for the renderbox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use crate::core::{JobCoordinator, RenderReport};
