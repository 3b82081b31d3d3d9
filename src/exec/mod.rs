//! Renderer execution
//!
//! Builds the renderer command line and supervises one child process per
//! render under a wall-clock deadline.

pub mod command;
pub mod supervisor;

pub use command::RenderInvocation;
pub use supervisor::{KillReport, ProcessSupervisor, RenderJob};
