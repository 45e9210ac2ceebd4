//! Process management module
//!
//! Spawning and signalling of agent child processes, plus detaching the
//! server itself into the background.

mod child;
mod launcher;
#[cfg(test)]
mod mock;

pub use child::*;
pub use launcher::*;
#[cfg(test)]
pub use mock::*;
