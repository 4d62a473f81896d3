//! Builder and build models for the Buildbot data API.
//!
//! Raw records carry timestamps as seconds since the epoch. They are turned
//! into `DateTime<Utc>` while deserializing, so callers never see the raw
//! numbers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ForemanError;

/// Human readable descriptions of the build result codes, indexed by code.
pub const BUILD_RESULTS_DESCRIPTIONS: [&str; 7] = [
    "completed successfully",
    "completed with warnings",
    "failed",
    "was skipped",
    "stopped with exception",
    "has been retried",
    "was cancelled",
];

/// Result code of a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    /// 0
    Success,
    /// 1
    Warnings,
    /// 2
    Failure,
    /// 3
    Skipped,
    /// 4
    Exception,
    /// 5
    Retry,
    /// 6
    Cancelled,
}

impl BuildResult {
    /// Maps a raw result code, if known.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(BuildResult::Success),
            1 => Some(BuildResult::Warnings),
            2 => Some(BuildResult::Failure),
            3 => Some(BuildResult::Skipped),
            4 => Some(BuildResult::Exception),
            5 => Some(BuildResult::Retry),
            6 => Some(BuildResult::Cancelled),
            _ => None,
        }
    }

    /// Sentence fragment describing the result ("failed", "was skipped", ...).
    pub fn description(&self) -> &'static str {
        BUILD_RESULTS_DESCRIPTIONS[*self as usize]
    }
}

/// A single build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Unique ID of this build.
    pub buildid: u64,

    /// Build number, sequential for a given builder.
    pub number: u64,

    /// ID of the builder this build belongs to.
    pub builderid: u64,

    /// Build request this build was performed for.
    #[serde(default)]
    pub buildrequestid: Option<u64>,

    /// Worker the build ran on.
    #[serde(default)]
    pub workerid: Option<u64>,

    /// Master the build ran on.
    #[serde(default)]
    pub masterid: Option<u64>,

    /// Time at which the build started.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,

    /// Time at which the build completed. Absent while it is running.
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub complete_at: Option<DateTime<Utc>>,

    /// Detail on the state of the build.
    #[serde(default)]
    pub state_string: String,

    /// Raw result code, absent until the build completes.
    #[serde(default)]
    pub results: Option<u32>,

    /// Build properties, when requested.
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

impl Build {
    /// True once the build has a completion time.
    pub fn complete(&self) -> bool {
        self.complete_at.is_some()
    }

    /// Decoded result, if the build has one.
    pub fn result(&self) -> Option<BuildResult> {
        self.results.and_then(BuildResult::from_code)
    }

    /// Short summary like "#12 failed" or "#13 building".
    pub fn summary(&self) -> String {
        match (self.complete(), self.result()) {
            (true, Some(result)) => format!("#{} {}", self.number, result.description()),
            (true, None) => format!("#{} completed", self.number),
            (false, _) => format!("#{} {}", self.number, self.display_state()),
        }
    }

    /// The state string, or a placeholder when the server sent none.
    pub fn display_state(&self) -> &str {
        if self.state_string.is_empty() {
            "running"
        } else {
            &self.state_string
        }
    }
}

/// A builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Builder {
    /// ID of this builder.
    pub builderid: u64,

    /// Builder name.
    pub name: String,

    /// Tags attached to the builder.
    #[serde(default)]
    pub tags: Option<Vec<String>>,

    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,

    /// IDs of the masters this builder runs on.
    #[serde(default)]
    pub masterids: Vec<u64>,

    /// Most recent completed build, attached by the client on request.
    /// Never sent by the server.
    #[serde(skip)]
    pub last_build: Option<Build>,
}

impl Builder {
    /// True if at least one master hosts this builder.
    pub fn is_active(&self) -> bool {
        !self.masterids.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct BuildersEnvelope {
    builders: Vec<Builder>,
}

#[derive(Debug, Deserialize)]
struct BuildsEnvelope {
    builds: Vec<Build>,
}

/// Extracts the builders of a `builders` response, keeping only those hosted
/// by at least one master.
///
/// # Errors
///
/// Returns `ForemanError::Protocol` if the response has no `builders` list
/// or a record is malformed.
pub fn normalize_builders(value: serde_json::Value) -> Result<Vec<Builder>, ForemanError> {
    let envelope: BuildersEnvelope = serde_json::from_value(value)
        .map_err(|e| ForemanError::protocol(format!("invalid builders response: {}", e)))?;

    Ok(envelope
        .builders
        .into_iter()
        .filter(Builder::is_active)
        .collect())
}

/// Extracts the builds of a `builds` response with timestamps converted.
///
/// # Errors
///
/// Returns `ForemanError::Protocol` if the response has no `builds` list or a
/// record is malformed.
pub fn normalize_builds(value: serde_json::Value) -> Result<Vec<Build>, ForemanError> {
    let envelope: BuildsEnvelope = serde_json::from_value(value)
        .map_err(|e| ForemanError::protocol(format!("invalid builds response: {}", e)))?;
    Ok(envelope.builds)
}
