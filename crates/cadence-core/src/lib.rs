//! `cadence-core`: configuration and process-level errors shared by the
//! cadence crates.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
