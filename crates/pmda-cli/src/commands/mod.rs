//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod check_config;
pub mod init_db;
pub mod run;
pub mod status;
