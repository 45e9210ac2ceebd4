//! Configuration module
//!
//! Handles loading proxy settings from TOML and merging command line overrides.

mod settings;

pub use settings::*;
