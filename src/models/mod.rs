//! Data models for the Buildbot data API.
//!
//! This module contains the builder and build records, force scheduler
//! parameter trees, and the envelopes used by control and error responses.

mod build;
mod common;
mod force;

pub use build::*;
pub use common::*;
pub use force::*;
