//! HTTP client for the Buildbot data API.
//!
//! This module provides [`ApiClient`], the single entry point for requests
//! to `{url}/api/v2/...`. Authentication is transparent: a 401 or 403 is
//! handed to the [`SessionAuthController`], which re-authenticates, and the
//! very same request is sent again.
//!
//! # Retry Logic
//!
//! Only authentication failures are retried, immediately and for as long as
//! each attempt yields a usable credential. Every other failure is terminal
//! on first occurrence.
//!
//! # Declined authentication
//!
//! When the user declines to authenticate the request returns `Ok(None)`:
//! that is a normal choice, not an error.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::ForemanError;
use crate::models::{
    normalize_builders, normalize_builds, Build, Builder, ErrorBody, ForceScheduler,
    JsonRpcRequest, JsonRpcResponse,
};
use crate::session::{
    AuthDecision, AuthFailure, AuthPhase, PasswordState, Prompt, SecretStore,
    SessionAuthController,
};

/// Network timeout of every call, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 3;

/// Path prefix of the data API.
const API_PREFIX: &str = "api/v2";

/// Maximum length of an error body kept when it cannot be decoded.
const MAX_ERROR_BODY_LEN: usize = 500;

struct Shared {
    config: Config,
    http: Client,
    session: SessionAuthController,
}

/// HTTP client for the Buildbot API.
///
/// Cloning is cheap; clones share the HTTP clients and the auth session.
///
/// # Example
///
/// ```ignore
/// let config = Config::from_env()?;
/// let client = ApiClient::new(&config, secrets, prompt)?;
///
/// if let Some(builders) = client.list_builders().await? {
///     for builder in builders {
///         println!("{}: {}", builder.builderid, builder.name);
///     }
/// }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    shared: Arc<Mutex<Shared>>,
}

impl ApiClient {
    /// Creates a client from configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Server URL, user and TLS settings
    /// * `secrets` - Where passwords are looked up and saved
    /// * `prompt` - How missing user names and passwords are asked for
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::HttpClient` if an HTTP client fails to initialize.
    pub fn new(
        config: &Config,
        secrets: Arc<dyn SecretStore>,
        prompt: Arc<dyn Prompt>,
    ) -> Result<Self, ForemanError> {
        let (http, login_http) = Self::build_clients(config.allow_self_signed)?;

        let session = SessionAuthController::new(
            config.url.clone(),
            config.host(),
            config.user.clone(),
            login_http,
            secrets,
            prompt,
        );

        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                config: config.clone(),
                http,
                session,
            })),
        })
    }

    /// Builds the API client and the login client (which never follows
    /// redirects, so the login response's cookies stay visible).
    fn build_clients(allow_self_signed: bool) -> Result<(Client, Client), ForemanError> {
        let timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);

        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(allow_self_signed)
            .build()
            .map_err(ForemanError::HttpClient)?;

        let login_http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(allow_self_signed)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ForemanError::HttpClient)?;

        Ok((http, login_http))
    }

    /// Applies a changed configuration.
    ///
    /// A different URL or user resets the session (password forgotten, auth
    /// headers dropped). The TLS setting is always re-applied.
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::HttpClient` if an HTTP client fails to initialize.
    pub async fn reconfigure(&self, config: &Config) -> Result<(), ForemanError> {
        let (http, login_http) = Self::build_clients(config.allow_self_signed)?;
        let mut shared = self.shared.lock().await;

        if shared.config.url != config.url || shared.config.user != config.user {
            tracing::info!(url = %config.url, "Configuration changed, resetting session");
            shared
                .session
                .reset(config.url.clone(), config.host(), config.user.clone());
        }

        shared.http = http;
        shared.session.set_login_client(login_http);
        shared.config = config.clone();
        Ok(())
    }

    /// The server URL.
    pub async fn url(&self) -> String {
        self.shared.lock().await.config.url.clone()
    }

    /// The current user name, if known.
    pub async fn user(&self) -> Option<String> {
        self.shared.lock().await.session.user().map(str::to_string)
    }

    /// The current authentication phase.
    pub async fn auth_phase(&self) -> AuthPhase {
        self.shared.lock().await.session.phase()
    }

    /// The known password, only for scrubbing it from error messages.
    pub(crate) async fn secret_for_sanitization(&self) -> String {
        match &self.shared.lock().await.session.credentials().password {
            PasswordState::Known(password) => password.clone(),
            _ => String::new(),
        }
    }

    /// Sends a request to `{url}/api/v2/{endpoint}`.
    ///
    /// POSTs `body` as JSON when given, GETs otherwise. Authentication
    /// failures are handled by the session and the request is re-issued.
    ///
    /// # Returns
    ///
    /// The parsed JSON body, or `None` if the user declined to authenticate.
    ///
    /// # Errors
    ///
    /// - `ServerError` for any other non-success status
    /// - `Timeout`/`Transport` for network failures
    /// - `Serialization` if a successful response is not JSON
    /// - challenge errors raised while re-authenticating
    pub async fn request(
        &self,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ForemanError> {
        let method = if body.is_some() { Method::POST } else { Method::GET };

        loop {
            let (http, url, headers, generation) = {
                let shared = self.shared.lock().await;
                let (headers, generation) = shared.session.snapshot();
                let url = format!("{}/{}/{}", shared.config.url, API_PREFIX, endpoint);
                (shared.http.clone(), url, headers, generation)
            };

            tracing::debug!(method = %method, endpoint = %endpoint, "Making Buildbot API request");

            let authenticated = !headers.is_empty();
            let mut req = http.request(method.clone(), &url).headers(headers);
            if let Some(body) = body {
                req = req.json(body);
            }

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    return ForemanError::timeout(
                        Duration::from_secs(DEFAULT_TIMEOUT_SECS),
                        format!("{} {}", method, endpoint),
                    );
                }
                ForemanError::Transport(e)
            })?;
            let status = response.status();

            if status.is_success() {
                if authenticated {
                    self.shared.lock().await.session.confirm(generation);
                }
                let text = response.text().await.map_err(ForemanError::Transport)?;
                tracing::trace!(body = %text, "Buildbot API response");
                return Ok(Some(serde_json::from_str(&text)?));
            }

            if status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN {
                return Err(Self::handle_http_error(status, response).await);
            }

            let failure = AuthFailure::from_response(&response, &method);
            let decision = {
                let mut shared = self.shared.lock().await;
                shared.session.handle_failure(&failure, generation).await?
            };

            match decision {
                AuthDecision::Retry => {
                    tracing::debug!(endpoint = %endpoint, "Re-issuing request after authentication");
                }
                AuthDecision::GiveUp => {
                    tracing::info!(
                        endpoint = %endpoint,
                        status = %status,
                        "Authentication declined, request not completed"
                    );
                    return Ok(None);
                }
            }
        }
    }

    /// Converts a failed response into a `ServerError`.
    ///
    /// The message comes from a `{"error": {"message": ...}}` body when there
    /// is one, else from the status reason.
    async fn handle_http_error(status: StatusCode, response: reqwest::Response) -> ForemanError {
        let body = response.text().await.unwrap_or_default();

        let message = ErrorBody::decode_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });

        if !body.is_empty() {
            let excerpt: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
            tracing::debug!(status = %status, body = %excerpt, "Buildbot API error response");
        }

        ForemanError::server(status, message)
    }

    /// Tests connectivity to the server.
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::ConnectionTest` describing why the server could
    /// not be reached.
    pub async fn test_connection(&self) -> Result<(), ForemanError> {
        tracing::debug!("Testing connection to Buildbot");

        match self.request("builders?limit=1", None).await {
            Ok(Some(_)) => {
                tracing::info!("Connection test successful");
                Ok(())
            }
            Ok(None) => Err(ForemanError::connection_test(
                "authentication was declined - set BUILDBOT_USER and BUILDBOT_PASSWORD",
            )),
            Err(ForemanError::Timeout { duration, .. }) => Err(ForemanError::connection_test(
                format!(
                    "connection timed out after {:?} - verify BUILDBOT_URL is correct and the server is reachable",
                    duration
                ),
            )),
            Err(ForemanError::Transport(e)) => Err(ForemanError::connection_test(format!(
                "HTTP error: {} - verify BUILDBOT_URL is correct",
                e
            ))),
            Err(e) => {
                let secret = self.secret_for_sanitization().await;
                Err(ForemanError::connection_test(e.sanitized_display(&secret)))
            }
        }
    }

    /// Lists the builders hosted by at least one master.
    pub async fn list_builders(&self) -> Result<Option<Vec<Builder>>, ForemanError> {
        match self.request("builders", None).await? {
            Some(value) => normalize_builders(value).map(Some),
            None => Ok(None),
        }
    }

    /// Lists active builders, each with its most recent completed build.
    ///
    /// The per-builder lookups run concurrently through [`request`](Self::request).
    pub async fn list_builders_with_last_build(
        &self,
    ) -> Result<Option<Vec<Builder>>, ForemanError> {
        let Some(mut builders) = self.list_builders().await? else {
            return Ok(None);
        };

        let lookups = builders
            .iter()
            .map(|builder| self.fetch_last_build(builder.builderid));
        let last_builds = try_join_all(lookups).await?;

        for (builder, last) in builders.iter_mut().zip(last_builds) {
            match last {
                Some(build) => builder.last_build = build,
                None => return Ok(None),
            }
        }

        Ok(Some(builders))
    }

    /// Outer `None`: declined. Inner `None`: the builder never completed a build.
    async fn fetch_last_build(&self, builderid: u64) -> Result<Option<Option<Build>>, ForemanError> {
        let endpoint = format!(
            "builders/{}/builds?complete=true&order=-number&limit=1",
            builderid
        );
        match self.request(&endpoint, None).await? {
            Some(value) => Ok(Some(normalize_builds(value)?.into_iter().next())),
            None => Ok(None),
        }
    }

    /// Lists running builds, optionally of one builder only.
    pub async fn running_builds(
        &self,
        builderid: Option<u64>,
    ) -> Result<Option<Vec<Build>>, ForemanError> {
        let endpoint = match builderid {
            Some(id) => format!("builders/{}/builds?complete=false", id),
            None => "builds?complete=false".to_string(),
        };
        match self.request(&endpoint, None).await? {
            Some(value) => normalize_builds(value).map(Some),
            None => Ok(None),
        }
    }

    /// Gets a single build.
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::Protocol` if the server answers with no build.
    pub async fn get_build(&self, buildid: u64) -> Result<Option<Build>, ForemanError> {
        let Some(value) = self.request(&format!("builds/{}", buildid), None).await? else {
            return Ok(None);
        };
        normalize_builds(value)?
            .into_iter()
            .next()
            .map(Some)
            .ok_or_else(|| ForemanError::protocol(format!("build {} not returned", buildid)))
    }

    /// Stops a running build.
    pub async fn stop_build(
        &self,
        buildid: u64,
        reason: Option<&str>,
    ) -> Result<Option<Value>, ForemanError> {
        let rpc = serde_json::to_value(JsonRpcRequest::stop(reason))?;
        tracing::debug!(buildid, "Stopping build");
        self.control(&format!("builds/{}", buildid), &rpc).await
    }

    /// Lists force schedulers, optionally only those able to trigger `builder_name`.
    pub async fn force_schedulers(
        &self,
        builder_name: Option<&str>,
    ) -> Result<Option<Vec<ForceScheduler>>, ForemanError> {
        let Some(value) = self.request("forceschedulers", None).await? else {
            return Ok(None);
        };
        let schedulers = Self::schedulers_from(value)?;

        Ok(Some(match builder_name {
            Some(name) => schedulers.into_iter().filter(|s| s.targets(name)).collect(),
            None => schedulers,
        }))
    }

    /// Gets one force scheduler by name.
    pub async fn force_scheduler(&self, name: &str) -> Result<Option<ForceScheduler>, ForemanError> {
        let endpoint = format!("forceschedulers/{}", urlencoding::encode(name));
        let Some(value) = self.request(&endpoint, None).await? else {
            return Ok(None);
        };
        Self::schedulers_from(value)?
            .into_iter()
            .next()
            .map(Some)
            .ok_or_else(|| ForemanError::protocol(format!("force scheduler {} not returned", name)))
    }

    fn schedulers_from(value: Value) -> Result<Vec<ForceScheduler>, ForemanError> {
        #[derive(serde::Deserialize)]
        struct Envelope {
            forceschedulers: Vec<ForceScheduler>,
        }

        serde_json::from_value::<Envelope>(value)
            .map(|e| e.forceschedulers)
            .map_err(|e| ForemanError::protocol(format!("invalid forceschedulers response: {}", e)))
    }

    /// Forces a build through a scheduler with a complete parameter map.
    pub async fn force_build(
        &self,
        scheduler: &str,
        parameters: serde_json::Map<String, Value>,
    ) -> Result<Option<Value>, ForemanError> {
        let rpc = serde_json::to_value(JsonRpcRequest::force(parameters))?;
        tracing::debug!(scheduler = %scheduler, "Forcing build");
        let endpoint = format!("forceschedulers/{}", urlencoding::encode(scheduler));
        self.control(&endpoint, &rpc).await
    }

    async fn control(&self, endpoint: &str, rpc: &Value) -> Result<Option<Value>, ForemanError> {
        match self.request(endpoint, Some(rpc)).await? {
            Some(value) => {
                let response: JsonRpcResponse = serde_json::from_value(value)?;
                Ok(Some(response.result))
            }
            None => Ok(None),
        }
    }

    /// Web UI page listing all builders.
    pub async fn builders_web_url(&self) -> String {
        builders_page(&self.url().await)
    }

    /// Web UI page of a builder.
    pub async fn builder_web_url(&self, builderid: u64) -> String {
        builder_page(&self.url().await, builderid)
    }

    /// Web UI page of a build.
    pub async fn build_web_url(&self, build: &Build) -> String {
        build_page(&self.url().await, build)
    }
}

/// Web UI page listing all builders of the server at `url`.
pub fn builders_page(url: &str) -> String {
    format!("{}/#/builders", url)
}

/// Web UI page of a builder.
pub fn builder_page(url: &str, builderid: u64) -> String {
    format!("{}/#/builders/{}", url, builderid)
}

/// Web UI page of a build.
pub fn build_page(url: &str, build: &Build) -> String {
    format!("{}/#/builders/{}/builds/{}", url, build.builderid, build.number)
}
