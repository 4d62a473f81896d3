//! Configuration management for Foreman.
//!
//! This module handles loading configuration from environment variables,
//! with validation to ensure required values are present and well formed.

use std::env;
use std::fmt;

use crate::error::ForemanError;

/// Configuration for connecting to a Buildbot master.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the Buildbot web UI (e.g., `https://ci.example.com`).
    pub url: String,

    /// User name, if one is configured. When absent the session starts
    /// anonymous and a user name is prompted for on the first 401/403.
    pub user: Option<String>,

    /// Password used to seed the secret store.
    /// This value must never be logged or included in error messages.
    pub password: Option<String>,

    /// Accept self-signed TLS certificates.
    pub allow_self_signed: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("allow_self_signed", &self.allow_self_signed)
            .finish()
    }
}

impl Config {
    /// Creates a configuration for `url` with no user and strict TLS.
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::Config` if the URL is not http(s).
    pub fn new(url: impl Into<String>) -> Result<Self, ForemanError> {
        Ok(Config {
            url: Self::validate_url(url.into())?,
            user: None,
            password: None,
            allow_self_signed: false,
        })
    }

    /// Sets the user name.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the password that seeds the secret store.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Enables or disables acceptance of self-signed certificates.
    #[must_use]
    pub fn with_allow_self_signed(mut self, allow: bool) -> Self {
        self.allow_self_signed = allow;
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUILDBOT_URL` (required): base URL of the Buildbot master
    /// - `BUILDBOT_USER`: user name
    /// - `BUILDBOT_PASSWORD`: password seeding the secret store
    /// - `BUILDBOT_ALLOW_SELF_SIGNED`: `true`, `1` or `yes` to relax TLS checks
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::Config` if the URL is missing or invalid, or if
    /// the self-signed flag is not a recognizable boolean.
    pub fn from_env() -> Result<Self, ForemanError> {
        let url = Self::get_required_env("BUILDBOT_URL")?;
        let url = Self::validate_url(url)?;

        let allow_self_signed = match Self::get_optional_env("BUILDBOT_ALLOW_SELF_SIGNED") {
            Some(raw) => Self::parse_flag("BUILDBOT_ALLOW_SELF_SIGNED", &raw)?,
            None => false,
        };

        Ok(Config {
            url,
            user: Self::get_optional_env("BUILDBOT_USER"),
            password: Self::get_optional_env("BUILDBOT_PASSWORD"),
            allow_self_signed,
        })
    }

    /// Gets a required environment variable, returning an error if missing or empty.
    fn get_required_env(name: &str) -> Result<String, ForemanError> {
        Self::get_optional_env(name).ok_or_else(|| ForemanError::missing_env(name))
    }

    /// Gets an optional environment variable, treating blank values as unset.
    fn get_optional_env(name: &str) -> Option<String> {
        env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Validates and normalizes the base URL.
    fn validate_url(url: String) -> Result<String, ForemanError> {
        let url = url.trim().trim_end_matches('/').to_string();

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ForemanError::invalid_config(
                "BUILDBOT_URL must start with http:// or https://",
            ));
        }

        url::Url::parse(&url)
            .map_err(|e| ForemanError::invalid_config(format!("BUILDBOT_URL is invalid: {}", e)))?;

        Ok(url)
    }

    fn parse_flag(name: &str, raw: &str) -> Result<bool, ForemanError> {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ForemanError::invalid_config(format!(
                "{} must be a boolean, got {:?}",
                name, raw
            ))),
        }
    }

    /// Returns the host part of the URL, used to key stored secrets.
    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{}:{}", h, port),
                    None => h.to_string(),
                })
            })
            .unwrap_or_else(|| self.url.clone())
    }
}
