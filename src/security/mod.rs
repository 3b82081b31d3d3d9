//! Input screening
//!
//! Upload name hygiene and the binary asset gate that runs before any
//! asset is stored or locked.

pub mod filename;
pub mod validator;

pub use validator::Validator;
