//! Tool input parameter structs for MCP tools.
//!
//! This module defines the input types for each MCP tool, with
//! JSON Schema derivation for MCP tool discovery.
//!
//! # Input Sanitization
//!
//! Input structs with text fields implement `sanitize()`, which trims
//! whitespace and drops empty values. Call it before processing input.

use std::collections::HashMap;

use rmcp::schemars::{self, JsonSchema};
use serde::Deserialize;

fn trim_option(s: &Option<String>) -> Option<String> {
    s.as_ref().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Input parameters for the list_builders tool.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ListBuildersInput {
    /// Also fetch each builder's most recent completed build (default: true).
    #[serde(default)]
    pub include_last_build: Option<bool>,
}

/// Input parameters for the list_running_builds tool.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ListRunningBuildsInput {
    /// Only list builds of this builder (e.g., "linux-x86_64").
    #[serde(default)]
    pub builder: Option<String>,
}

impl ListRunningBuildsInput {
    /// Sanitizes input by trimming whitespace from the builder name.
    #[must_use]
    pub fn sanitize(self) -> Self {
        Self {
            builder: trim_option(&self.builder),
        }
    }
}

/// Input parameters for the stop_build tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct StopBuildInput {
    /// The build ID (not the per-builder build number).
    pub build_id: u64,

    /// Why the build is stopped, shown in the build's status.
    #[serde(default)]
    pub reason: Option<String>,
}

impl StopBuildInput {
    /// Sanitizes input by trimming whitespace from the reason.
    #[must_use]
    pub fn sanitize(self) -> Self {
        Self {
            build_id: self.build_id,
            reason: trim_option(&self.reason),
        }
    }
}

/// Input parameters for the list_force_schedulers tool.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ListForceSchedulersInput {
    /// Only list schedulers able to build this builder.
    #[serde(default)]
    pub builder: Option<String>,
}

impl ListForceSchedulersInput {
    /// Sanitizes input by trimming whitespace from the builder name.
    #[must_use]
    pub fn sanitize(self) -> Self {
        Self {
            builder: trim_option(&self.builder),
        }
    }
}

/// Input parameters for the force_build tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ForceBuildInput {
    /// Name of the builder to build.
    pub builder: String,

    /// Force scheduler to use. Required only when several schedulers can
    /// build the builder.
    #[serde(default)]
    pub scheduler: Option<String>,

    /// Parameter values by name (e.g., {"branch": "main", "reason": "release"}).
    /// Parameters left out keep their defaults.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl ForceBuildInput {
    /// Sanitizes input by trimming names and values.
    ///
    /// Values are trimmed but kept when empty, so a default can be cleared.
    #[must_use]
    pub fn sanitize(self) -> Self {
        Self {
            builder: self.builder.trim().to_string(),
            scheduler: trim_option(&self.scheduler),
            parameters: self
                .parameters
                .into_iter()
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .collect(),
        }
    }
}
