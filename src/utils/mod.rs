//! Utilities
//!
//! Bounded collection of merged renderer output.

pub mod output;
