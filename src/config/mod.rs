//! Configuration
//!
//! Config loading, startup validation and shared type definitions.

pub mod loader;
pub mod types;
pub mod validator;

pub use loader::RenderboxConfig;
