//! Database pool initialization and shared tables

pub mod init;
pub mod settings;

pub use init::{init_database, init_memory_database};
pub use settings::{get_or_init_setting, get_setting, set_setting};
