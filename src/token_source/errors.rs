use crate::error::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`TokenSource`](super::TokenSource).
///
/// Connection problems ([`TokenSourceError::Unavailable`],
/// [`TokenSourceError::Timeout`]) are kept apart from issuance refusals
/// ([`TokenSourceError::Denied`]) so callers can apply different retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenSourceError {
    /// The request was invalid and was not sent.
    #[error("invalid identity request: {0}")]
    Configuration(#[from] ConfigError),

    /// The identity agent could not be reached.
    #[error("identity agent unavailable: {0}")]
    Unavailable(String),

    /// The identity agent refused to issue a token (e.g. no matching registration entry).
    #[error("identity agent denied token issuance: {0}")]
    Denied(String),

    /// The identity agent did not answer within the configured timeout.
    #[error("identity agent did not respond within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The agent returned a token that could not be decoded.
    #[error("malformed identity token: {0}")]
    MalformedToken(String),

    /// The request was cancelled.
    #[error("identity token request cancelled")]
    Cancelled,
}

impl TokenSourceError {
    /// Returns a stable, low-cardinality label for telemetry.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Unavailable(_) => "identity_unavailable",
            Self::Denied(_) => "identity_denied",
            Self::Timeout(_) => "identity_timeout",
            Self::MalformedToken(_) => "malformed_token",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` if the agent could not be reached (including timeouts).
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}
