use thiserror::Error;

/// Failures while configuring or starting the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Whitelist store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures talking to the external whitelist store.
///
/// All of these are transient from the synchronizer's point of view: the
/// refresh attempt is abandoned and the current ruleset stays published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0} ms")]
    Timeout(u64),

    #[error("Store protocol error: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Timeout(0)
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// A whitelist specification that could not be compiled into a pattern
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid whitelist specification '{spec}': {reason}")]
pub struct CompileError {
    pub spec: String,
    pub reason: String,
}

impl CompileError {
    pub(crate) fn new(spec: &str, reason: impl Into<String>) -> Self {
        Self {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

/// Why a credential was rejected. Only ever used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    Malformed,
    BadSignature,
    Expired,
    MissingClaim(&'static str),
    InvalidClaim(&'static str),
}

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationFailure::Malformed => write!(f, "malformed token"),
            VerificationFailure::BadSignature => write!(f, "signature mismatch"),
            VerificationFailure::Expired => write!(f, "token expired"),
            VerificationFailure::MissingClaim(claim) => write!(f, "missing claim '{claim}'"),
            VerificationFailure::InvalidClaim(claim) => write!(f, "invalid claim '{claim}'"),
        }
    }
}

/// A credential failed verification.
///
/// Every failure collapses into this one type; the reason is kept for logs
/// and never reaches the caller's response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Credential verification failed")]
pub struct VerificationError {
    failure: VerificationFailure,
}

impl VerificationError {
    pub(crate) fn new(failure: VerificationFailure) -> Self {
        Self { failure }
    }

    pub fn reason(&self) -> VerificationFailure {
        self.failure
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        let failure = match err.kind() {
            ErrorKind::InvalidSignature => VerificationFailure::BadSignature,
            ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => VerificationFailure::Expired,
            ErrorKind::MissingRequiredClaim(_) => VerificationFailure::MissingClaim("exp"),
            ErrorKind::InvalidIssuer => VerificationFailure::InvalidClaim("iss"),
            ErrorKind::InvalidAudience => VerificationFailure::InvalidClaim("aud"),
            ErrorKind::InvalidSubject => VerificationFailure::InvalidClaim("sub"),
            _ => VerificationFailure::Malformed,
        };
        Self::new(failure)
    }
}
