//! HTTP Basic and Digest (RFC 2617, MD5) authorization.
//!
//! Given the `WWW-Authenticate` challenge of a 401 response, [`compute_auth`]
//! produces the value for the `Authorization` header of the retried request.
//!
//! The nonce count is a single process-wide counter rather than one counter
//! per server nonce. A fresh client nonce is generated for every response, so
//! servers never see a repeated `(nonce, nc, cnonce)` triple.

use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use rand::Rng;

use crate::error::ForemanError;

/// Number of hex characters in a generated client nonce.
pub const CNONCE_SIZE: usize = 32;

/// Shortest header that can possibly carry a challenge.
const MIN_CHALLENGE_LEN: usize = 5;

const HEX_ALPHABET: &[u8] = b"abcdef0123456789";

static GLOBAL_NONCE_COUNTER: NonceCounter = NonceCounter::new();

/// Monotonic nonce count shared by every Digest response in the process.
///
/// Starts at zero and is incremented once before each use, so the first
/// response carries `nc=00000001`. It is never reset.
#[derive(Debug, Default)]
pub struct NonceCounter {
    value: AtomicU64,
}

impl NonceCounter {
    /// Creates a counter at zero.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// The process-wide counter used by [`compute_auth`].
    pub fn global() -> &'static NonceCounter {
        &GLOBAL_NONCE_COUNTER
    }

    /// Increments the counter and returns the new value.
    pub fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the last value handed out (zero if none yet).
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Formats a nonce count as the 8 hex digit `nc` value.
pub fn format_nc(count: u64) -> String {
    format!("{:08x}", count)
}

/// Authentication scheme named by a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `Basic realm="..."`.
    Basic,
    /// Anything else is treated as Digest.
    Digest,
}

/// Quality of protection selected from a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    /// Authentication only.
    Auth,
    /// Authentication with body integrity. Not supported.
    AuthInt,
}

impl Qop {
    /// The directive value as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The scheme token.
    pub scheme: Scheme,
    /// Protection realm. Empty for Basic.
    pub realm: String,
    /// Server nonce. Empty for Basic.
    pub nonce: String,
    /// Opaque value to echo back, if the server sent one.
    pub opaque: Option<String>,
    /// Selected qop. `None` means RFC 2069 compatibility mode.
    pub qop: Option<Qop>,
}

impl Challenge {
    /// Parses a challenge header.
    ///
    /// # Errors
    ///
    /// Returns `ForemanError::MalformedChallenge` if the header is shorter
    /// than five characters.
    pub fn parse(header: &str) -> Result<Self, ForemanError> {
        if header.len() < MIN_CHALLENGE_LEN {
            return Err(ForemanError::MalformedChallenge);
        }

        let scheme_token = header.split_whitespace().next().unwrap_or_default();
        if scheme_token == "Basic" {
            return Ok(Challenge {
                scheme: Scheme::Basic,
                realm: String::new(),
                nonce: String::new(),
                opaque: None,
                qop: None,
            });
        }

        // realm keeps its inner whitespace, the other fields are compacted
        let realm = attribute(header, "realm")
            .map(|v| v.replace('"', ""))
            .unwrap_or_default();
        let nonce = attribute(header, "nonce").map(compact).unwrap_or_default();
        let opaque = attribute(header, "opaque").map(compact);
        let qop = attribute(header, "qop").and_then(|raw| select_qop(&compact(raw)));

        Ok(Challenge {
            scheme: Scheme::Digest,
            realm,
            nonce,
            opaque,
            qop,
        })
    }
}

/// Finds `key="quoted value"` or `key=bare` in a challenge, case-insensitively.
///
/// Bare values end at the next comma, so a bare value containing a comma is
/// cut short. Quoted values are returned with their quotes.
fn attribute<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let params = header
        .split_once(char::is_whitespace)
        .map(|(_, rest)| rest)
        .unwrap_or(header);

    let mut rest = params;
    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            return None;
        }

        let eq = rest.find('=')?;
        // a bare value cut at its comma leaves a fragment in front of the next key
        let name = rest[..eq]
            .trim_end()
            .rsplit(|c: char| c == ',' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let after = &rest[eq + 1..];

        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&after[..end + 2], &quoted[end + 1..]),
                None => (after, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        if name.eq_ignore_ascii_case(key) {
            return Some(value.trim());
        }
        rest = remainder;
    }
}

fn compact(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '"' && !c.is_whitespace())
        .collect()
}

/// Picks `auth` over `auth-int`; anything else means qop is absent.
fn select_qop(options: &str) -> Option<Qop> {
    let offered: Vec<&str> = options.split(',').collect();
    if offered.contains(&"auth") {
        Some(Qop::Auth)
    } else if offered.contains(&"auth-int") {
        Some(Qop::AuthInt)
    } else {
        None
    }
}

/// Returns the request path and query of `url`, as used in the digest `uri`.
///
/// Everything from the first `/` once the scheme's `//` is removed, or `/`
/// if the URL has no path.
pub fn digest_uri(url: &str) -> String {
    let stripped = url.replacen("//", "", 1);
    match stripped.find('/') {
        Some(idx) => stripped[idx..].to_string(),
        None => "/".to_string(),
    }
}

/// Generates a fresh random lowercase hex client nonce.
pub fn make_cnonce() -> String {
    let mut rng = rand::thread_rng();
    (0..CNONCE_SIZE)
        .map(|_| HEX_ALPHABET[rng.gen_range(0..HEX_ALPHABET.len())] as char)
        .collect()
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Computes the `Authorization` header value answering a challenge.
///
/// Uses the process-wide [`NonceCounter`] and a fresh client nonce.
///
/// # Arguments
///
/// * `challenge` - The raw `WWW-Authenticate` header, if the response had one
/// * `user`, `password` - Credentials
/// * `method` - HTTP method of the request being retried
/// * `url` - Resolved URL of the challenged response
///
/// # Errors
///
/// - `MalformedChallenge` if the header is missing or too short
/// - `UnsupportedAuthMode` if the server only offers `auth-int`
pub fn compute_auth(
    challenge: Option<&str>,
    user: &str,
    password: &str,
    method: &str,
    url: &str,
) -> Result<String, ForemanError> {
    let cnonce = make_cnonce();
    compute_auth_with(
        challenge,
        user,
        password,
        method,
        url,
        NonceCounter::global(),
        &cnonce,
    )
}

/// [`compute_auth`] with an explicit counter and client nonce.
pub fn compute_auth_with(
    challenge: Option<&str>,
    user: &str,
    password: &str,
    method: &str,
    url: &str,
    counter: &NonceCounter,
    cnonce: &str,
) -> Result<String, ForemanError> {
    let challenge = Challenge::parse(challenge.ok_or(ForemanError::MalformedChallenge)?)?;

    if challenge.scheme == Scheme::Basic {
        return Ok(format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", user, password))
        ));
    }

    if challenge.qop == Some(Qop::AuthInt) {
        return Err(ForemanError::unsupported_auth(Qop::AuthInt.as_str()));
    }

    let uri = digest_uri(url);
    let nc = format_nc(counter.advance());

    let ha1 = md5_hex(&format!("{}:{}:{}", user, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    let response = match challenge.qop {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1,
            challenge.nonce,
            nc,
            cnonce,
            qop.as_str(),
            ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    };

    let mut header = format!(
        "Digest username=\"{}\",realm=\"{}\",nonce=\"{}\",uri=\"{}\",",
        user, challenge.realm, challenge.nonce, uri
    );
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!("opaque=\"{}\",", opaque));
    }
    if let Some(qop) = challenge.qop {
        header.push_str(&format!("qop=\"{}\",", qop.as_str()));
    }
    header.push_str(&format!(
        "algorithm=MD5,response=\"{}\",nc={},cnonce=\"{}\"",
        response, nc, cnonce
    ));

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RFC_CHALLENGE: &str = "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
         nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
         opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"";

    #[test]
    fn test_rfc2617_example_response() {
        let counter = NonceCounter::new();
        let header = compute_auth_with(
            Some(RFC_CHALLENGE),
            "Mufasa",
            "Circle Of Life",
            "GET",
            "http://www.nowhere.org/dir/index.html",
            &counter,
            "0a4f113b",
        )
        .unwrap();

        assert_eq!(
            header,
            "Digest username=\"Mufasa\",realm=\"testrealm@host.com\",\
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\",uri=\"/dir/index.html\",\
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\",qop=\"auth\",algorithm=MD5,\
             response=\"6629fae49393a05397450978507c4ef1\",nc=00000001,cnonce=\"0a4f113b\""
        );
    }

    #[test]
    fn test_basic_challenge() {
        let header = compute_auth(
            Some("Basic realm=\"buildbot\""),
            "alice",
            "secret",
            "POST",
            "http://ci/api/v2/builders",
        )
        .unwrap();
        assert_eq!(header, format!("Basic {}", STANDARD.encode("alice:secret")));
        assert_eq!(header, "Basic YWxpY2U6c2VjcmV0");
    }

    #[test]
    fn test_short_or_missing_challenge_is_malformed() {
        let err = compute_auth(Some("Dig"), "u", "p", "GET", "http://h/").unwrap_err();
        assert!(matches!(err, ForemanError::MalformedChallenge));

        let err = compute_auth(None, "u", "p", "GET", "http://h/").unwrap_err();
        assert!(matches!(err, ForemanError::MalformedChallenge));
    }

    #[test]
    fn test_auth_int_only_is_unsupported() {
        let counter = NonceCounter::new();
        let err = compute_auth_with(
            Some("Digest realm=\"r\", nonce=\"n\", qop=\"auth-int\""),
            "u",
            "p",
            "GET",
            "http://h/",
            &counter,
            "c",
        )
        .unwrap_err();
        assert!(matches!(err, ForemanError::UnsupportedAuthMode { .. }));
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_legacy_digest_without_qop() {
        let counter = NonceCounter::new();
        let header = compute_auth_with(
            Some("Digest realm=\"testrealm@host.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\""),
            "Mufasa",
            "Circle Of Life",
            "GET",
            "http://www.nowhere.org/dir/index.html",
            &counter,
            "0a4f113b",
        )
        .unwrap();

        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("GET:/dir/index.html");
        let expected = md5_hex(&format!("{}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{}", ha1, ha2));

        assert!(header.contains(&format!("response=\"{}\"", expected)));
        assert!(!header.contains("qop="));
        assert!(!header.contains("opaque="));
    }

    #[test]
    fn test_unquoted_attributes() {
        let challenge =
            Challenge::parse("Digest realm=buildbot,nonce=abc123,qop=auth,opaque=xyz").unwrap();
        assert_eq!(challenge.realm, "buildbot");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert_eq!(challenge.qop, Some(Qop::Auth));
    }

    #[test]
    fn test_unquoted_value_stops_at_comma() {
        let challenge = Challenge::parse("Digest realm=a,b, nonce=\"n\"").unwrap();
        assert_eq!(challenge.realm, "a");
        assert_eq!(challenge.nonce, "n");
    }

    #[test]
    fn test_quoted_realm_keeps_spaces_and_commas() {
        let challenge =
            Challenge::parse("Digest realm=\"Build Bot, Inc\", nonce=\"n n\"").unwrap();
        assert_eq!(challenge.realm, "Build Bot, Inc");
        assert_eq!(challenge.nonce, "nn");
    }

    #[test]
    fn test_qop_selection() {
        assert_eq!(select_qop("auth-int,auth"), Some(Qop::Auth));
        assert_eq!(select_qop("auth-int"), Some(Qop::AuthInt));
        assert_eq!(select_qop("token"), None);

        let challenge = Challenge::parse("Digest realm=\"r\", qop=\"auth-int, auth\"").unwrap();
        assert_eq!(challenge.qop, Some(Qop::Auth));
    }

    #[test]
    fn test_cnonce_does_not_match_attribute_name() {
        let challenge = Challenge::parse("Digest cnonce=\"wrong\", nonce=\"right\"").unwrap();
        assert_eq!(challenge.nonce, "right");
    }

    #[test]
    fn test_digest_uri() {
        assert_eq!(
            digest_uri("http://ci.example.com:8010/api/v2/builders?limit=1"),
            "/api/v2/builders?limit=1"
        );
        assert_eq!(digest_uri("https://ci.example.com"), "/");
        assert_eq!(digest_uri("http://h/auth/login"), "/auth/login");
    }

    #[test]
    fn test_counter_increments_per_response() {
        let counter = NonceCounter::new();
        let first = compute_auth_with(
            Some(RFC_CHALLENGE), "u", "p", "GET", "http://h/", &counter, "a",
        )
        .unwrap();
        let second = compute_auth_with(
            Some(RFC_CHALLENGE), "u", "p", "GET", "http://h/", &counter, "b",
        )
        .unwrap();

        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert_eq!(counter.current(), 2);
        assert_eq!(format_nc(255), "000000ff");
    }

    #[test]
    fn test_make_cnonce_is_lowercase_hex() {
        let a = make_cnonce();
        let b = make_cnonce();
        assert_eq!(a.len(), CNONCE_SIZE);
        assert!(a.bytes().all(|c| HEX_ALPHABET.contains(&c)));
        assert_ne!(a, b);
    }
}
