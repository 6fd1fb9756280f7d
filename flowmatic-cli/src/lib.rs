//! Flowmatic CLI library.
//!
//! Command handlers and report types are exposed for integration tests;
//! the `flowmatic` binary (main.rs) only parses arguments and dispatches.

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;
