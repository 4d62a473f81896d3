//! MCP tool inputs for Foreman.
//!
//! This module contains the input types of the MCP tools that expose
//! Buildbot operations.

mod inputs;

pub use inputs::*;
