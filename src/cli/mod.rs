//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running the supervised device plugin
//! - Configuration handling
//! - The directory-backed sample device source

pub mod commands;
pub mod dir_source;
pub mod handlers;

pub use handlers::{handle_config, handle_serve, init_logging};
