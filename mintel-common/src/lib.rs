//! # Mintel Common Library
//!
//! Shared code for the mintel services:
//! - Error type
//! - Bootstrap configuration and root folder resolution
//! - Logging setup
//! - SQLite pool initialization and the settings table
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{Error, Result};
