use std::fmt;

use crate::config::ProtocolVersion;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// OAuth 2.0 style error codes carried by client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    InvalidGrant,
    InvalidClient,
    InvalidProof,
    InvalidDpopProof,
    InvalidTransactionId,
    InvalidCredentialRequest,
    InsufficientAuthorization,
    InvalidAuthSession,
    InvalidPresentation,
    InvalidScope,
    InvalidNotificationId,
    RedirectToWeb,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidGrant => "invalid_grant",
            ErrorCode::InvalidClient => "invalid_client",
            ErrorCode::InvalidProof => "invalid_proof",
            ErrorCode::InvalidDpopProof => "invalid_dpop_proof",
            ErrorCode::InvalidTransactionId => "invalid_transaction_id",
            ErrorCode::InvalidCredentialRequest => "invalid_credential_request",
            ErrorCode::InsufficientAuthorization => "insufficient_authorization",
            ErrorCode::InvalidAuthSession => "invalid_auth_session",
            ErrorCode::InvalidPresentation => "invalid_presentation",
            ErrorCode::InvalidScope => "invalid_scope",
            ErrorCode::InvalidNotificationId => "invalid_notification_id",
            ErrorCode::RedirectToWeb => "redirect_to_web",
        }
    }

    /// The code behind an `error` value received from another party.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            ErrorCode::InvalidRequest,
            ErrorCode::InvalidGrant,
            ErrorCode::InvalidClient,
            ErrorCode::InvalidProof,
            ErrorCode::InvalidDpopProof,
            ErrorCode::InvalidTransactionId,
            ErrorCode::InvalidCredentialRequest,
            ErrorCode::InsufficientAuthorization,
            ErrorCode::InvalidAuthSession,
            ErrorCode::InvalidPresentation,
            ErrorCode::InvalidScope,
            ErrorCode::InvalidNotificationId,
            ErrorCode::RedirectToWeb,
        ]
        .into_iter()
        .find(|code| code.as_str() == name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Errors raised by the issuance, verification, query and trust layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The holder (or relying party) supplied input that is malformed or violates policy.
    #[error("{code}: {description}")]
    Client {
        code: ErrorCode,
        description: String,
    },
    /// A signature, certificate chain, federation chain or audience check failed.
    #[error("trust verification failed: {0}")]
    Trust(String),
    /// The requested feature cannot be used with the negotiated protocol version.
    #[error("not supported by protocol version {version}: {reason}")]
    Protocol {
        version: ProtocolVersion,
        reason: String,
    },
    /// Issuer or verifier configuration is missing or internally inconsistent.
    #[error("server error: {0}")]
    Server(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("expired: {0}")]
    Expired(String),
    /// A compare-and-swap observed a newer session revision.
    #[error("session '{0}' was modified concurrently")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn client(code: ErrorCode, description: impl Into<String>) -> Self {
        Error::Client {
            code,
            description: description.into(),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::client(ErrorCode::InvalidRequest, description)
    }

    pub fn trust(reason: impl Into<String>) -> Self {
        Error::Trust(reason.into())
    }

    pub fn server(reason: impl Into<String>) -> Self {
        Error::Server(reason.into())
    }

    pub fn protocol(version: ProtocolVersion, reason: impl Into<String>) -> Self {
        Error::Protocol {
            version,
            reason: reason.into(),
        }
    }

    /// The OAuth error code, if this is a client error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Client { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Error::Client { .. })
    }

    pub fn is_trust(&self) -> bool {
        matches!(self, Error::Trust(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server(_))
    }
}

/// Re-wraps any failure of a trust-relevant step as [Error::Trust], keeping the cause chain
/// in the message.
pub(crate) trait OrTrustError<T> {
    fn or_trust(self, what: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> OrTrustError<T> for std::result::Result<T, E> {
    fn or_trust(self, what: &str) -> Result<T> {
        self.map_err(|e| {
            let e: anyhow::Error = e.into();
            Error::Trust(format!("{what}: {e:#}"))
        })
    }
}
