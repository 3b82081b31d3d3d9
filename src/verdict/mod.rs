//! Outcome classification
//!
//! Deterministic Done/Failed decision from exit status, renderer output
//! and artifact presence.

pub mod classify;

pub use classify::{OutcomeClassifier, RenderEvidence};
