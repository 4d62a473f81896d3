//! Session authentication for the Buildbot API.
//!
//! Buildbot masters are reached anonymously, through HTTP Digest/Basic
//! challenges (401), or through a login endpoint that hands out a session
//! cookie (403). [`SessionAuthController`] owns the credentials and the
//! headers attached to every request, and decides how to react to each
//! authentication failure.
//!
//! # State machine
//!
//! ```text
//!   Anonymous ──401/403──▶ Challenged ──credential──▶ Authenticated
//!       ▲                      │                           │
//!       │               declined password            401/403 again
//!       │                      ▼                           │
//!  user prompt             Denied (terminal)   ◀──declined─┘
//!   cancelled
//! ```
//!
//! A 401/403 on headers that already worked (see
//! [`SessionAuthController::confirm`]) is answered again with the known
//! password. Only a fresh answer that gets rejected leads to a prompt.
//!
//! Every re-authentication replaces the [`AuthState`] wholesale, so a stale
//! cookie never survives next to a fresh `Authorization` header and vice
//! versa.
//!
//! # Security
//!
//! Passwords, `Authorization` values and cookies are never logged.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE, SET_COOKIE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, StatusCode};

use crate::digest::compute_auth;
use crate::error::ForemanError;

/// Namespace under which passwords are kept in the secret store.
pub const SERVICE_NAMESPACE: &str = "Foreman Buildbot";

/// Prefix of the session cookie set by the login endpoint.
pub const SESSION_COOKIE_PREFIX: &str = "TWISTED_SESSION=";

/// Path of the login endpoint, relative to the server URL.
pub const LOGIN_PATH: &str = "auth/login";

/// Key of a stored password.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountKey {
    /// Service namespace, always [`SERVICE_NAMESPACE`].
    pub namespace: String,
    /// Server host (and port).
    pub host: String,
    /// User name.
    pub user: String,
}

impl AccountKey {
    /// Creates the key for `user` on `host`.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            namespace: SERVICE_NAMESPACE.to_string(),
            host: host.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.user)
    }
}

/// Storage for passwords, keyed by account.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the stored secret, if any.
    async fn get(&self, account: &AccountKey) -> Option<String>;

    /// Stores a secret, replacing any previous one.
    async fn set(&self, account: &AccountKey, secret: &str);
}

/// Interactive questions to the user.
///
/// `None` means the user cancelled the question, which is different from
/// answering with an empty string.
#[async_trait]
pub trait Prompt: Send + Sync {
    /// Asks for a secret value (input is masked).
    async fn ask_secret(&self, message: &str) -> Option<String>;

    /// Asks for a text value, pre-filled with `default`.
    async fn ask_text(&self, message: &str, default: Option<&str>) -> Option<String>;

    /// Asks the user to pick one of `options`.
    async fn choose(&self, options: &[String], placeholder: Option<&str>) -> Option<String>;
}

/// In-memory [`SecretStore`], living as long as the process.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<AccountKey, String>>,
}

impl MemorySecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding one secret.
    pub fn with_secret(account: AccountKey, secret: impl Into<String>) -> Self {
        let store = Self::new();
        store.insert(account, secret.into());
        store
    }

    fn insert(&self, account: AccountKey, secret: String) {
        self.secrets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(account, secret);
    }

    /// Returns the stored secret without going through the async trait.
    pub fn peek(&self, account: &AccountKey) -> Option<String> {
        self.secrets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(account)
            .cloned()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, account: &AccountKey) -> Option<String> {
        self.peek(account)
    }

    async fn set(&self, account: &AccountKey, secret: &str) {
        self.insert(account.clone(), secret.to_string());
    }
}

/// A [`Prompt`] for hosts that cannot ask the user anything.
///
/// Every question is cancelled, so a session without stored credentials
/// ends as declined instead of blocking.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractivePrompt;

#[async_trait]
impl Prompt for NonInteractivePrompt {
    async fn ask_secret(&self, message: &str) -> Option<String> {
        tracing::debug!(%message, "Cannot prompt for secret in non-interactive mode");
        None
    }

    async fn ask_text(&self, message: &str, _default: Option<&str>) -> Option<String> {
        tracing::debug!(%message, "Cannot prompt for text in non-interactive mode");
        None
    }

    async fn choose(&self, _options: &[String], _placeholder: Option<&str>) -> Option<String> {
        None
    }
}

/// What is known about the password.
#[derive(Clone, PartialEq, Eq)]
pub enum PasswordState {
    /// Not looked up yet.
    Absent,
    /// Looked up or entered.
    Known(String),
    /// The user declined to give one. Terminal for the session.
    Denied,
}

impl fmt::Debug for PasswordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordState::Absent => f.write_str("Absent"),
            PasswordState::Known(_) => f.write_str("Known([REDACTED])"),
            PasswordState::Denied => f.write_str("Denied"),
        }
    }
}

/// Credentials of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Host the credentials belong to.
    pub host: String,
    /// User name, if configured or entered.
    pub user: Option<String>,
    /// Password state.
    pub password: PasswordState,
}

impl Credentials {
    /// Secret store key, once a user name is known.
    pub fn account(&self) -> Option<AccountKey> {
        self.user
            .as_ref()
            .map(|user| AccountKey::new(self.host.clone(), user.clone()))
    }
}

/// Headers attached to every request of the session.
///
/// Replaced as a whole on every re-authentication, never patched.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    headers: HeaderMap,
}

impl AuthState {
    /// A state carrying an `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::MalformedChallenge` if the value cannot be a
    /// header (it is built from challenge fields).
    pub fn authorization(value: &str) -> Result<Self, ForemanError> {
        Ok(Self::single(AUTHORIZATION, sensitive(value)?))
    }

    /// A state carrying a `Cookie` header.
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::Protocol` if the server sent an unusable cookie.
    pub fn cookie(value: &str) -> Result<Self, ForemanError> {
        let value = sensitive(value)
            .map_err(|_| ForemanError::protocol("session cookie is not a valid header value"))?;
        Ok(Self::single(COOKIE, value))
    }

    fn single(name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(name, value);
        Self { headers }
    }

    /// The headers to attach.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// True if nothing is attached (anonymous requests).
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

fn sensitive(value: &str) -> Result<HeaderValue, ForemanError> {
    let mut header = HeaderValue::from_str(value).map_err(|_| ForemanError::MalformedChallenge)?;
    header.set_sensitive(true);
    Ok(header)
}

/// Phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// No credentials sent yet.
    Anonymous,
    /// Handling a 401/403.
    Challenged,
    /// Credentials attached to requests.
    Authenticated,
    /// The user declined to authenticate. No further prompts.
    Denied,
}

/// What the request loop should do after a failure was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Re-issue the same request with the new auth state.
    Retry,
    /// Stop and report the last response.
    GiveUp,
}

/// The parts of a 401/403 response needed to re-authenticate.
#[derive(Debug, Clone)]
pub struct AuthFailure {
    /// 401 or 403.
    pub status: StatusCode,
    /// Raw `WWW-Authenticate` header.
    pub challenge: Option<String>,
    /// Resolved URL of the response.
    pub url: String,
    /// Method of the failed request.
    pub method: Method,
}

impl AuthFailure {
    /// Captures the failure details of `response` to a `method` request.
    pub fn from_response(response: &reqwest::Response, method: &Method) -> Self {
        Self {
            status: response.status(),
            challenge: header_text(response.headers(), WWW_AUTHENTICATE),
            url: response.url().to_string(),
            method: method.clone(),
        }
    }
}

fn header_text(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Picks the session cookie out of a login response.
///
/// The last matching `Set-Cookie` wins; only its `name=value` part is kept.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter(|v| v.starts_with(SESSION_COOKIE_PREFIX))
        .last()
        .and_then(|v| v.split(';').next())
        .map(|pair| pair.trim().to_string())
}

/// Owner of the session's credentials and auth headers.
///
/// Not re-entrant: callers serialize access (the API client keeps it behind
/// an async mutex).
pub struct SessionAuthController {
    base_url: String,
    credentials: Credentials,
    state: AuthState,
    phase: AuthPhase,
    generation: u64,
    confirmed: Option<u64>,
    login_http: Client,
    secrets: Arc<dyn SecretStore>,
    prompt: Arc<dyn Prompt>,
}

impl SessionAuthController {
    /// Creates an anonymous session.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Server URL without the `/api/v2` suffix
    /// * `host` - Host used to key stored secrets
    /// * `user` - Configured user name, if any
    /// * `login_http` - Client used for the login endpoint; must not follow redirects
    /// * `secrets`, `prompt` - Credential sources
    pub fn new(
        base_url: impl Into<String>,
        host: impl Into<String>,
        user: Option<String>,
        login_http: Client,
        secrets: Arc<dyn SecretStore>,
        prompt: Arc<dyn Prompt>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            credentials: Credentials {
                host: host.into(),
                user,
                password: PasswordState::Absent,
            },
            state: AuthState::default(),
            phase: AuthPhase::Anonymous,
            generation: 0,
            confirmed: None,
            login_http,
            secrets,
            prompt,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Current credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Current auth state.
    pub fn auth_state(&self) -> &AuthState {
        &self.state
    }

    /// The user name, if known.
    pub fn user(&self) -> Option<&str> {
        self.credentials.user.as_deref()
    }

    /// Headers to attach plus the generation they belong to.
    ///
    /// Pass the generation back to [`handle_failure`](Self::handle_failure)
    /// so a failure seen with an outdated state just retries.
    pub fn snapshot(&self) -> (HeaderMap, u64) {
        (self.state.headers().clone(), self.generation)
    }

    /// Forgets everything for a new server or user.
    pub fn reset(&mut self, base_url: impl Into<String>, host: impl Into<String>, user: Option<String>) {
        self.base_url = base_url.into();
        self.credentials = Credentials {
            host: host.into(),
            user,
            password: PasswordState::Absent,
        };
        self.replace_state(AuthState::default());
        self.confirmed = None;
        self.phase = AuthPhase::Anonymous;
    }

    /// Records that a request sent with the headers of `generation` succeeded.
    ///
    /// A later 401/403 on those headers means they went stale (rotated nonce,
    /// other request URI, expired cookie), not that the password is wrong.
    pub fn confirm(&mut self, generation: u64) {
        if generation == self.generation && !self.state.is_empty() {
            self.confirmed = Some(generation);
        }
    }

    /// Swaps the login client (used when TLS settings change).
    pub fn set_login_client(&mut self, login_http: Client) {
        self.login_http = login_http;
    }

    fn replace_state(&mut self, state: AuthState) {
        self.state = state;
        self.generation += 1;
    }

    /// Reacts to a 401/403 and decides whether the request is retried.
    ///
    /// # Arguments
    ///
    /// * `failure` - The failed response
    /// * `seen_generation` - Generation of the headers the request was sent with
    ///
    /// # Errors
    ///
    /// Challenge and transport errors while re-authenticating are terminal
    /// for the request.
    pub async fn handle_failure(
        &mut self,
        failure: &AuthFailure,
        seen_generation: u64,
    ) -> Result<AuthDecision, ForemanError> {
        if self.phase == AuthPhase::Denied {
            return Ok(AuthDecision::GiveUp);
        }

        if seen_generation != self.generation {
            // another request re-authenticated in the meantime
            tracing::debug!("Auth state changed while request was in flight, retrying");
            return Ok(AuthDecision::Retry);
        }

        let previous = self.phase;
        self.phase = AuthPhase::Challenged;

        let Some(user) = self.ensure_user().await else {
            tracing::debug!("User name prompt cancelled");
            self.phase = previous;
            return Ok(AuthDecision::GiveUp);
        };

        let proven = self.confirmed == Some(seen_generation);
        let Some(password) = self.ensure_password(&user, proven).await else {
            tracing::warn!(user = %user, "Password declined, giving up on authentication");
            self.phase = AuthPhase::Denied;
            return Ok(AuthDecision::GiveUp);
        };

        self.replace_state(AuthState::default());

        let state = match self.authenticate(failure, &user, &password).await {
            Ok(state) => state,
            Err(e) => {
                // headers were cleared above
                self.phase = AuthPhase::Anonymous;
                return Err(e);
            }
        };

        self.replace_state(state);
        self.phase = AuthPhase::Authenticated;
        Ok(AuthDecision::Retry)
    }

    /// Digest answer for a 401, cookie login for a 403.
    async fn authenticate(
        &self,
        failure: &AuthFailure,
        user: &str,
        password: &str,
    ) -> Result<AuthState, ForemanError> {
        if failure.status == StatusCode::UNAUTHORIZED {
            tracing::debug!(url = %failure.url, "Answering authentication challenge");
            let value = compute_auth(
                failure.challenge.as_deref(),
                user,
                password,
                failure.method.as_str(),
                &failure.url,
            )?;
            AuthState::authorization(&value)
        } else {
            self.login(user, password).await
        }
    }

    async fn ensure_user(&mut self) -> Option<String> {
        if let Some(user) = &self.credentials.user {
            return Some(user.clone());
        }

        let message = format!("Enter user name for '{}'", self.base_url);
        let user = self
            .prompt
            .ask_text(&message, None)
            .await
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())?;

        tracing::info!(user = %user, "User name entered");
        self.credentials.user = Some(user.clone());
        Some(user)
    }

    /// Looks the password up once, then prompts. An empty or cancelled
    /// answer is recorded as denied.
    ///
    /// `proven` tells that the failing headers had been accepted before, so
    /// a known password is answered with again instead of prompting.
    async fn ensure_password(&mut self, user: &str, proven: bool) -> Option<String> {
        let account = self.credentials.account()?;

        match &self.credentials.password {
            PasswordState::Denied => return None,
            PasswordState::Known(known) if proven => {
                tracing::debug!(user = %user, "Session went stale, answering again with the known password");
                return Some(known.clone());
            }
            PasswordState::Absent => {
                if let Some(stored) = self.secrets.get(&account).await {
                    self.credentials.password = PasswordState::Known(stored.clone());
                    return Some(stored);
                }
            }
            // the known password was just rejected
            PasswordState::Known(_) => {}
        }

        let message = format!("Enter password for user '{}' on '{}'", user, self.base_url);
        match self.prompt.ask_secret(&message).await {
            Some(password) if !password.is_empty() => {
                self.secrets.set(&account, &password).await;
                self.credentials.password = PasswordState::Known(password.clone());
                Some(password)
            }
            _ => {
                self.credentials.password = PasswordState::Denied;
                None
            }
        }
    }

    /// Logs in through the login endpoint and returns the cookie state.
    ///
    /// The first GET only fetches the endpoint's own challenge; the second
    /// answers it. Redirects are not followed so the cookie of the redirect
    /// response is visible.
    async fn login(&self, user: &str, password: &str) -> Result<AuthState, ForemanError> {
        let login_url = format!("{}/{}", self.base_url, LOGIN_PATH);
        tracing::debug!(url = %login_url, "Starting login session");

        let probe = self
            .login_http
            .get(&login_url)
            .send()
            .await
            .map_err(ForemanError::Transport)?;
        let challenge = header_text(probe.headers(), WWW_AUTHENTICATE);
        let auth = compute_auth(
            challenge.as_deref(),
            user,
            password,
            Method::GET.as_str(),
            probe.url().as_str(),
        )?;

        let response = self
            .login_http
            .get(&login_url)
            .header(AUTHORIZATION, auth)
            .send()
            .await
            .map_err(ForemanError::Transport)?;

        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            tracing::warn!(status = %status, "Login request was rejected");
            return Ok(AuthState::default());
        }

        match session_cookie(response.headers()) {
            Some(cookie) => {
                tracing::info!(user = %user, "Login session established");
                AuthState::cookie(&cookie)
            }
            None => {
                tracing::warn!(status = %status, "Login response carried no session cookie");
                Ok(AuthState::default())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    /// A [`Prompt`] answering from a script and recording the questions.
    #[derive(Default)]
    pub struct ScriptedPrompt {
        secrets: Mutex<VecDeque<Option<String>>>,
        texts: Mutex<VecDeque<Option<String>>>,
        choices: Mutex<VecDeque<Option<String>>>,
        asked: Mutex<Vec<String>>,
    }

    impl ScriptedPrompt {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn secret(self, answer: Option<&str>) -> Self {
            self.secrets.lock().unwrap().push_back(answer.map(str::to_string));
            self
        }

        pub fn text(self, answer: Option<&str>) -> Self {
            self.texts.lock().unwrap().push_back(answer.map(str::to_string));
            self
        }

        pub fn choice(self, answer: Option<&str>) -> Self {
            self.choices.lock().unwrap().push_back(answer.map(str::to_string));
            self
        }

        pub fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prompt for ScriptedPrompt {
        async fn ask_secret(&self, message: &str) -> Option<String> {
            self.asked.lock().unwrap().push(message.to_string());
            self.secrets.lock().unwrap().pop_front().flatten()
        }

        async fn ask_text(&self, message: &str, _default: Option<&str>) -> Option<String> {
            self.asked.lock().unwrap().push(message.to_string());
            self.texts.lock().unwrap().pop_front().flatten()
        }

        async fn choose(&self, _options: &[String], placeholder: Option<&str>) -> Option<String> {
            self.asked
                .lock()
                .unwrap()
                .push(placeholder.unwrap_or("choose").to_string());
            self.choices.lock().unwrap().pop_front().flatten()
        }
    }

    pub fn login_client() -> Client {
        Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{login_client, ScriptedPrompt};
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHALLENGE: &str = "Digest realm=\"buildbot\", nonce=\"abc\", qop=\"auth\"";

    fn controller(
        base_url: &str,
        user: Option<&str>,
        secrets: Arc<MemorySecretStore>,
        prompt: Arc<ScriptedPrompt>,
    ) -> SessionAuthController {
        SessionAuthController::new(
            base_url,
            "ci.example.com",
            user.map(str::to_string),
            login_client(),
            secrets,
            prompt,
        )
    }

    fn unauthorized() -> AuthFailure {
        AuthFailure {
            status: StatusCode::UNAUTHORIZED,
            challenge: Some(CHALLENGE.to_string()),
            url: "http://ci.example.com/api/v2/builders".to_string(),
            method: Method::GET,
        }
    }

    #[test]
    fn test_memory_store_keys_by_host_and_user() {
        let store = MemorySecretStore::new();
        let alice = AccountKey::new("ci.example.com", "alice");
        let other_host = AccountKey::new("ci.example.org", "alice");

        tokio_test::block_on(async {
            assert_eq!(store.get(&alice).await, None);
            store.set(&alice, "secret").await;
            assert_eq!(store.get(&other_host).await, None);
        });

        assert_eq!(store.peek(&alice).as_deref(), Some("secret"));
        assert_eq!(alice.to_string(), "ci.example.com:alice");
    }

    #[test]
    fn test_session_cookie_last_wins() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("TWISTED_SESSION=first; Path=/; HttpOnly"),
        );
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("TWISTED_SESSION=second; Path=/; HttpOnly"),
        );

        assert_eq!(
            session_cookie(&headers).as_deref(),
            Some("TWISTED_SESSION=second")
        );
        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn test_password_debug_is_redacted() {
        let state = PasswordState::Known("hunter2".to_string());
        assert_eq!(format!("{:?}", state), "Known([REDACTED])");
    }

    #[tokio::test]
    async fn test_401_uses_stored_password_without_prompting() {
        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account, "secret"));
        let prompt = Arc::new(ScriptedPrompt::new());
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt.clone());

        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&unauthorized(), generation).await.unwrap();

        assert_eq!(decision, AuthDecision::Retry);
        assert_eq!(session.phase(), AuthPhase::Authenticated);
        assert!(prompt.asked().is_empty());

        let value = session.auth_state().headers()[AUTHORIZATION].to_str().unwrap();
        assert!(value.starts_with("Digest username=\"alice\",realm=\"buildbot\""));
        assert!(value.contains("uri=\"/api/v2/builders\""));
        assert!(session.auth_state().headers().get(COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_rejected_password_prompts_and_persists() {
        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account.clone(), "stale"));
        let prompt = Arc::new(ScriptedPrompt::new().secret(Some("fresh")));
        let mut session =
            controller("http://ci.example.com", Some("alice"), secrets.clone(), prompt.clone());

        let (_, generation) = session.snapshot();
        session.handle_failure(&unauthorized(), generation).await.unwrap();
        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&unauthorized(), generation).await.unwrap();

        assert_eq!(decision, AuthDecision::Retry);
        assert_eq!(prompt.asked().len(), 1);
        assert!(prompt.asked()[0].contains("alice"));
        assert_eq!(secrets.peek(&account).as_deref(), Some("fresh"));
        assert_eq!(
            session.credentials().password,
            PasswordState::Known("fresh".to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_password_is_denied_for_good() {
        let secrets = Arc::new(MemorySecretStore::new());
        let prompt = Arc::new(ScriptedPrompt::new().secret(Some("")).secret(Some("late")));
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt.clone());

        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&unauthorized(), generation).await.unwrap();
        assert_eq!(decision, AuthDecision::GiveUp);
        assert_eq!(session.phase(), AuthPhase::Denied);

        let decision = session.handle_failure(&unauthorized(), generation).await.unwrap();
        assert_eq!(decision, AuthDecision::GiveUp);
        assert_eq!(prompt.asked().len(), 1);
        assert_eq!(session.credentials().password, PasswordState::Denied);
    }

    #[tokio::test]
    async fn test_missing_user_is_prompted() {
        let secrets = Arc::new(MemorySecretStore::new());
        let prompt = Arc::new(ScriptedPrompt::new().text(Some(" bob ")).secret(Some("pw")));
        let mut session = controller("http://ci.example.com", None, secrets.clone(), prompt.clone());

        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&unauthorized(), generation).await.unwrap();

        assert_eq!(decision, AuthDecision::Retry);
        assert_eq!(session.user(), Some("bob"));
        assert_eq!(
            secrets.peek(&AccountKey::new("ci.example.com", "bob")).as_deref(),
            Some("pw")
        );
    }

    #[tokio::test]
    async fn test_cancelled_user_prompt_gives_up_without_denying() {
        let secrets = Arc::new(MemorySecretStore::new());
        let prompt = Arc::new(ScriptedPrompt::new().text(None));
        let mut session = controller("http://ci.example.com", None, secrets, prompt.clone());

        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&unauthorized(), generation).await.unwrap();

        assert_eq!(decision, AuthDecision::GiveUp);
        assert_eq!(session.phase(), AuthPhase::Anonymous);
        assert_eq!(session.credentials().password, PasswordState::Absent);
    }

    #[tokio::test]
    async fn test_outdated_generation_retries_without_reauth() {
        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account, "secret"));
        let prompt = Arc::new(ScriptedPrompt::new());
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt);

        let (_, stale) = session.snapshot();
        session.handle_failure(&unauthorized(), stale).await.unwrap();
        let before = session.auth_state().headers().clone();

        let decision = session.handle_failure(&unauthorized(), stale).await.unwrap();
        assert_eq!(decision, AuthDecision::Retry);
        assert_eq!(session.auth_state().headers(), &before);
    }

    #[tokio::test]
    async fn test_malformed_challenge_is_terminal_error() {
        let secrets = Arc::new(MemorySecretStore::new());
        let prompt = Arc::new(ScriptedPrompt::new().secret(Some("pw")));
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt);

        let mut failure = unauthorized();
        failure.challenge = None;
        let (_, generation) = session.snapshot();
        let err = session.handle_failure(&failure, generation).await.unwrap_err();

        assert!(matches!(err, ForemanError::MalformedChallenge));
        assert!(session.auth_state().is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_headers_are_answered_again_without_prompt() {
        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account, "secret"));
        let prompt = Arc::new(ScriptedPrompt::new().secret(None));
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt.clone());

        let (_, generation) = session.snapshot();
        session.handle_failure(&unauthorized(), generation).await.unwrap();
        let (_, generation) = session.snapshot();
        session.confirm(generation);

        let mut stale = unauthorized();
        stale.url = "http://ci.example.com/api/v2/builds".to_string();
        stale.challenge = Some(format!("{}, stale=true", CHALLENGE));
        let decision = session.handle_failure(&stale, generation).await.unwrap();

        assert_eq!(decision, AuthDecision::Retry);
        assert!(prompt.asked().is_empty());
        assert_eq!(session.phase(), AuthPhase::Authenticated);
        let value = session.auth_state().headers()[AUTHORIZATION].to_str().unwrap();
        assert!(value.contains("uri=\"/api/v2/builds\""));

        // the new answer was never accepted, so its rejection prompts
        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&unauthorized(), generation).await.unwrap();
        assert_eq!(decision, AuthDecision::GiveUp);
        assert_eq!(prompt.asked().len(), 1);
        assert_eq!(session.phase(), AuthPhase::Denied);
    }

    #[tokio::test]
    async fn test_confirm_ignores_outdated_generation() {
        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account, "secret"));
        let prompt = Arc::new(ScriptedPrompt::new().secret(Some("other")));
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt.clone());

        let (_, anonymous) = session.snapshot();
        session.handle_failure(&unauthorized(), anonymous).await.unwrap();
        session.confirm(anonymous);

        let (_, generation) = session.snapshot();
        session.handle_failure(&unauthorized(), generation).await.unwrap();
        assert_eq!(prompt.asked().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reauthentication_leaves_session_anonymous() {
        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account, "secret"));
        let prompt = Arc::new(ScriptedPrompt::new());
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt);

        let (_, generation) = session.snapshot();
        session.handle_failure(&unauthorized(), generation).await.unwrap();
        let (_, generation) = session.snapshot();
        session.confirm(generation);
        assert_eq!(session.phase(), AuthPhase::Authenticated);

        let mut failure = unauthorized();
        failure.challenge = Some("Digest realm=\"buildbot\", nonce=\"abc\", qop=\"auth-int\"".to_string());
        let err = session.handle_failure(&failure, generation).await.unwrap_err();

        assert!(matches!(err, ForemanError::UnsupportedAuthMode { .. }));
        assert_eq!(session.phase(), AuthPhase::Anonymous);
        assert!(session.auth_state().is_empty());
    }

    #[tokio::test]
    async fn test_403_login_stores_last_session_cookie() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/login"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "/")
                    .append_header("set-cookie", "TWISTED_SESSION=first; Path=/; HttpOnly")
                    .append_header("set-cookie", "TWISTED_SESSION=second; Path=/; HttpOnly"),
            )
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", CHALLENGE))
            .expect(1)
            .mount(&server)
            .await;

        let secrets = Arc::new(MemorySecretStore::new());
        let prompt = Arc::new(ScriptedPrompt::new().secret(Some("pw")));
        let mut session = controller(&server.uri(), Some("alice"), secrets, prompt);

        let failure = AuthFailure {
            status: StatusCode::FORBIDDEN,
            challenge: None,
            url: format!("{}/api/v2/builders", server.uri()),
            method: Method::GET,
        };
        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&failure, generation).await.unwrap();

        assert_eq!(decision, AuthDecision::Retry);
        let headers = session.auth_state().headers();
        assert_eq!(headers[COOKIE], "TWISTED_SESSION=second");
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_login_without_cookie_clears_previous_digest() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/auth/login"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401).insert_header("www-authenticate", CHALLENGE))
            .mount(&server)
            .await;

        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account, "secret"));
        let prompt = Arc::new(ScriptedPrompt::new().secret(Some("secret")));
        let mut session = controller(&server.uri(), Some("alice"), secrets, prompt.clone());

        let (_, generation) = session.snapshot();
        session.handle_failure(&unauthorized(), generation).await.unwrap();
        assert!(session.auth_state().headers().get(AUTHORIZATION).is_some());

        let failure = AuthFailure {
            status: StatusCode::FORBIDDEN,
            challenge: None,
            url: format!("{}/api/v2/builders", server.uri()),
            method: Method::GET,
        };
        let (_, generation) = session.snapshot();
        let decision = session.handle_failure(&failure, generation).await.unwrap();

        assert_eq!(decision, AuthDecision::Retry);
        assert_eq!(prompt.asked().len(), 1);
        assert!(session.auth_state().is_empty());
    }

    #[tokio::test]
    async fn test_reset_forgets_session() {
        let account = AccountKey::new("ci.example.com", "alice");
        let secrets = Arc::new(MemorySecretStore::with_secret(account, "secret"));
        let prompt = Arc::new(ScriptedPrompt::new());
        let mut session = controller("http://ci.example.com", Some("alice"), secrets, prompt);

        let (_, generation) = session.snapshot();
        session.handle_failure(&unauthorized(), generation).await.unwrap();
        session.reset("http://other.example.com", "other.example.com", Some("bob".to_string()));

        assert_eq!(session.phase(), AuthPhase::Anonymous);
        assert!(session.auth_state().is_empty());
        assert_eq!(session.user(), Some("bob"));
        assert_eq!(session.credentials().password, PasswordState::Absent);
    }
}
