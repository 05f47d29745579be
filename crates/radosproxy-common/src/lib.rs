//! RadosProxy Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration and data types
//! used across all RadosProxy components.

pub mod config;
pub mod error;
pub mod types;

pub use config::ProxyConfig;
pub use error::{Error, Result, status_of};
pub use types::*;
