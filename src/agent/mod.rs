//! Agent conversation module
//!
//! Drives the agent executable one job at a time and turns its structured
//! output into typed stream events.

mod decoder;
mod events;
mod session;
mod supervisor;

pub use decoder::*;
pub use events::*;
pub use session::*;
pub use supervisor::*;
