//! dbvisor core - platform-independent building blocks for supervising a daemon process
//!
//! This crate provides the process specification and configuration types, the error
//! taxonomy, console output plumbing and the cleanup registry shared by the platform
//! crates and the supervisor itself.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod output;
pub mod process;

pub use cleanup::*;
pub use config::*;
pub use error::*;
pub use output::*;
pub use process::*;
