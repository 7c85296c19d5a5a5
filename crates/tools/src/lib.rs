//! Tool execution engine for Switchboard.
//!
//! [`ToolRegistry`] owns the registered tools. Every invocation goes through
//! [`ToolRegistry::run`], which validates the input against the tool's schema
//! and then hands it to [`runner::run_with_policy`] for timeout, retry and
//! panic handling.

pub mod registry;
pub mod runner;

pub use registry::ToolRegistry;
