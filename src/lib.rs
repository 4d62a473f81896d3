//! # Foreman
//!
//! Foreman is a client for the Buildbot continuous-integration data API,
//! exposed as an MCP (Model Context Protocol) server.
//!
//! It lists builders and their latest results, follows running builds, stops
//! them, and forces new builds through force schedulers. Authentication is
//! transparent: anonymous access first, then HTTP Digest/Basic challenges or
//! a cookie login, whichever the server demands.
//!
//! ## Architecture
//!
//! - [`config`] - Configuration loading from environment variables
//! - [`error`] - Error types with secret-scrubbing message sanitization
//! - [`digest`] - HTTP Digest (RFC 2617, MD5) and Basic authorization values
//! - [`session`] - Session authentication state machine and credential seams
//! - [`client`] - HTTP client for the Buildbot data API
//! - [`models`] - Builder, build and force scheduler models
//! - [`commands`] - Operator commands driven through a prompt
//! - [`server`] - MCP server implementation with tool routing
//! - [`tools`] - Tool input parameter structs
//!
//! ## Configuration
//!
//! - `BUILDBOT_URL`: Base URL of the Buildbot master (required)
//! - `BUILDBOT_USER`: User name, asked for on demand when absent
//! - `BUILDBOT_PASSWORD`: Password, asked for on demand when absent
//! - `BUILDBOT_ALLOW_SELF_SIGNED`: Accept self-signed certificates
//! - `RUST_LOG`: Log level (e.g., `foreman=debug`)
//!
//! ## Security Considerations
//!
//! Passwords, authorization values and session cookies are never logged and
//! are scrubbed from error messages.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use foreman::client::ApiClient;
//! use foreman::config::Config;
//! use foreman::session::{MemorySecretStore, NonInteractivePrompt};
//!
//! async fn example() -> Result<(), foreman::error::ForemanError> {
//!     let config = Config::from_env()?;
//!     let client = ApiClient::new(
//!         &config,
//!         Arc::new(MemorySecretStore::new()),
//!         Arc::new(NonInteractivePrompt),
//!     )?;
//!
//!     if let Some(builds) = client.running_builds(None).await? {
//!         for build in builds {
//!             println!("{}: {}", build.buildid, build.summary());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod client;
pub mod commands;
pub mod config;
pub mod digest;
pub mod error;
pub mod models;
pub mod server;
pub mod session;
pub mod tools;
