//! Shared data model, errors, and configuration for the Warden action
//! governance pipeline.

pub mod config;
pub mod error;
pub mod types;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use types::*;
