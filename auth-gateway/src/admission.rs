//! Per-request admission decisions
//!
//! A request is either whitelisted (forwarded untouched), authenticated
//! (forwarded with identity headers), or denied. Missing and invalid
//! credentials produce the same denial so callers cannot tell them apart.

use crate::config::{AdmissionConfig, DenialMode};
use crate::error::{GatewayError, Result};
use crate::sync::RulesetSource;
use crate::tokens::{CredentialVerifier, IdentityClaims};
use headers::{Cookie, HeaderMapExt};
use http::header::{AUTHORIZATION, REFERER};
use http::{HeaderMap, HeaderName, HeaderValue, Request};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

const BEARER_SCHEME: &str = "bearer";

/// Outcome of evaluating one request
#[derive(Debug)]
pub enum Verdict {
    /// Path matched the whitelist; no credential was consulted
    Whitelisted,
    /// Credential verified; carries the identity to forward
    Authenticated(Identity),
    Denied(Denial),
}

/// Verified identity plus the headers that carry it upstream
#[derive(Debug, Clone)]
pub struct Identity {
    pub claims: IdentityClaims,
    pub headers: HeaderMap,
}

/// Response owed to a caller that may not proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// 302 to the login page
    Redirect { location: HeaderValue },
    /// Bare 401
    Unauthorized,
}

/// Result of [`AdmissionEngine::admit`]
#[derive(Debug)]
pub enum Admission<B> {
    /// Dispatch this request upstream
    Forward(Request<B>),
    Deny(Denial),
}

/// Internal denial cause; only ever logged
#[derive(Debug, Clone, Copy)]
enum DenyReason {
    MissingCredential,
    InvalidCredential(crate::error::VerificationFailure),
    UnencodableIdentity,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::MissingCredential => write!(f, "no credential"),
            DenyReason::InvalidCredential(failure) => write!(f, "invalid credential: {failure}"),
            DenyReason::UnencodableIdentity => write!(f, "identity claims not representable as headers"),
        }
    }
}

struct IdentityHeaders {
    user_id: HeaderName,
    username: HeaderName,
    display_name: HeaderName,
}

/// Decides, per request, between whitelist bypass, authenticated forward,
/// and denial
pub struct AdmissionEngine {
    rules: Arc<dyn RulesetSource>,
    verifier: Arc<dyn CredentialVerifier>,
    login_url: String,
    default_home_url: String,
    redirect_param: String,
    cookie_name: String,
    denial_mode: DenialMode,
    identity_headers: IdentityHeaders,
}

impl AdmissionEngine {
    /// Build an engine over a ruleset source and a verifier.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] if the identity header names
    /// are invalid or the login URL cannot be used in a `Location` header.
    pub fn new(
        rules: Arc<dyn RulesetSource>,
        verifier: Arc<dyn CredentialVerifier>,
        config: &AdmissionConfig,
    ) -> Result<Self> {
        let [user_id, username, display_name] = config.identity_headers.parse()?;

        if config.denial_mode == DenialMode::Redirect {
            HeaderValue::from_str(&config.login_url).map_err(|_| {
                GatewayError::InvalidConfig(format!(
                    "admission.login_url '{}' is not a valid Location value",
                    config.login_url
                ))
            })?;
        }

        Ok(Self {
            rules,
            verifier,
            login_url: config.login_url.clone(),
            default_home_url: config.default_home_url.clone(),
            redirect_param: config.redirect_param.clone(),
            cookie_name: config.cookie_name.clone(),
            denial_mode: config.denial_mode,
            identity_headers: IdentityHeaders {
                user_id,
                username,
                display_name,
            },
        })
    }

    pub fn denial_mode(&self) -> DenialMode {
        self.denial_mode
    }

    /// Decide what happens to a request for `path` carrying `headers`.
    ///
    /// `path` must not include the query string. The whitelist is matched
    /// against the canonical form of `path` (see [`canonical_path`]).
    pub fn evaluate(&self, path: &str, headers: &HeaderMap) -> Verdict {
        match canonical_path(path) {
            Some(canonical) => {
                let rules = self.rules.current_ruleset();
                if let Some(pattern) = rules.find_match(&canonical) {
                    debug!(path, canonical = %canonical, pattern = %pattern, "Whitelisted request");
                    record_outcome("whitelisted");
                    return Verdict::Whitelisted;
                }
            }
            None => debug!(path, "Path has no canonical form; whitelist skipped"),
        }

        let Some(token) = extract_credential(headers, &self.cookie_name) else {
            return self.deny(path, headers, DenyReason::MissingCredential);
        };

        let claims = match self.verifier.verify(&token) {
            Ok(claims) => claims,
            Err(err) => return self.deny(path, headers, DenyReason::InvalidCredential(err.reason())),
        };

        let Some(identity_headers) = self.identity_header_map(&claims) else {
            return self.deny(path, headers, DenyReason::UnencodableIdentity);
        };

        debug!(path, user_id = claims.user_id, username = %claims.username, "Authenticated request");
        record_outcome("authenticated");
        Verdict::Authenticated(Identity {
            claims,
            headers: identity_headers,
        })
    }

    /// Evaluate a request and, when it may proceed, hand back the request to
    /// dispatch. Identity headers overwrite any client-supplied values.
    pub fn admit<B>(&self, request: Request<B>) -> Admission<B> {
        match self.evaluate(request.uri().path(), request.headers()) {
            Verdict::Whitelisted => Admission::Forward(request),
            Verdict::Authenticated(identity) => {
                let (mut parts, body) = request.into_parts();
                for (name, value) in &identity.headers {
                    parts.headers.insert(name.clone(), value.clone());
                }
                parts.extensions.insert(identity.claims);
                Admission::Forward(Request::from_parts(parts, body))
            }
            Verdict::Denied(denial) => Admission::Deny(denial),
        }
    }

    fn deny(&self, path: &str, headers: &HeaderMap, reason: DenyReason) -> Verdict {
        warn!(path, reason = %reason, "Request denied");
        record_outcome("denied");

        let denial = match self.denial_mode {
            DenialMode::Unauthorized => Denial::Unauthorized,
            DenialMode::Redirect => {
                let location = self.redirect_location(headers);
                match HeaderValue::from_str(&location) {
                    Ok(location) => Denial::Redirect { location },
                    Err(_) => {
                        error!(location = %location, "Redirect location is not a valid header value");
                        Denial::Unauthorized
                    }
                }
            }
        };
        Verdict::Denied(denial)
    }

    /// Login URL plus the post-login destination: the Referer when present,
    /// otherwise the default home URL
    fn redirect_location(&self, headers: &HeaderMap) -> String {
        let destination = headers
            .get(REFERER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.default_home_url);

        let (base, fragment) = match self.login_url.split_once('#') {
            Some((base, fragment)) => (base, Some(fragment)),
            None => (self.login_url.as_str(), None),
        };
        let separator = if !base.contains('?') {
            "?"
        } else if base.ends_with('?') || base.ends_with('&') {
            ""
        } else {
            "&"
        };

        let mut location = format!(
            "{base}{separator}{}={}",
            urlencoding::encode(&self.redirect_param),
            urlencoding::encode(destination)
        );
        if let Some(fragment) = fragment {
            location.push('#');
            location.push_str(fragment);
        }
        location
    }

    fn identity_header_map(&self, claims: &IdentityClaims) -> Option<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(3);
        headers.insert(self.identity_headers.user_id.clone(), HeaderValue::from(claims.user_id));
        headers.insert(
            self.identity_headers.username.clone(),
            HeaderValue::from_str(&claims.username).ok()?,
        );
        headers.insert(
            self.identity_headers.display_name.clone(),
            HeaderValue::from_str(claims.display_name.as_deref().unwrap_or_default()).ok()?,
        );
        Some(headers)
    }
}

/// Canonical form of a request path, as the upstream will route it.
///
/// Each segment is percent-decoded, then `.` and `..` segments are removed
/// as in RFC 3986 section 5.2.4. Returns `None` for a path that does not
/// start with `/`, does not decode to UTF-8, or hides a `/` or `\` inside
/// an encoded segment; such paths never match the whitelist.
pub fn canonical_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    let mut segments: Vec<Cow<'_, str>> = Vec::new();
    let mut ends_in_directory = false;

    for raw in rest.split('/') {
        let segment = urlencoding::decode(raw).ok()?;
        if segment.contains(['/', '\\']) {
            return None;
        }
        ends_in_directory = matches!(segment.as_ref(), "." | "..");
        match segment.as_ref() {
            "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    let mut canonical = format!("/{}", segments.join("/"));
    if ends_in_directory && !canonical.ends_with('/') {
        canonical.push('/');
    }
    Some(canonical)
}

/// Pull the bearer credential from `Authorization`, falling back to the
/// named cookie. A `Bearer ` scheme prefix is stripped; blank values count
/// as absent.
pub fn extract_credential(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(strip_bearer_scheme)
        .filter(|token| !token.is_empty());

    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    headers
        .typed_get::<Cookie>()
        .and_then(|cookie| {
            cookie
                .get(cookie_name)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        })
}

/// `Bearer <token>` yields the token, a bare scheme yields an empty string,
/// anything else is taken as the token itself
fn strip_bearer_scheme(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(char::is_whitespace) {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case(BEARER_SCHEME) => token.trim(),
        None if value.eq_ignore_ascii_case(BEARER_SCHEME) => "",
        _ => value,
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("gateway_admission_total", "outcome" => outcome).increment(1);
}
