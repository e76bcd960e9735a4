use crate::error::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the federated credential exchange.
///
/// Only [`ExchangeError::Throttled`] and [`ExchangeError::Unavailable`] are
/// retried, and only inside [`Exchanger`](super::Exchanger).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExchangeError {
    /// The request was invalid and was not sent.
    #[error("invalid exchange request: {0}")]
    Configuration(#[from] ConfigError),

    /// The requested session duration is outside the STS bounds.
    #[error("requested session duration {}s is outside the allowed range", .requested.as_secs())]
    InvalidDuration {
        /// The rejected duration.
        requested: Duration,
    },

    /// The role or its trust policy rejected the identity.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// STS rejected the identity token. A new token must be minted before retrying.
    #[error("identity token rejected: {0}")]
    InvalidToken(String),

    /// STS throttled the request.
    #[error("throttled: {0}")]
    Throttled(String),

    /// STS could not be reached, failed internally, or did not answer in time.
    #[error("STS unavailable: {0}")]
    Unavailable(String),

    /// STS rejected the request for a reason with no dedicated variant.
    #[error("STS rejected the request ({code}): {message}")]
    Rejected {
        /// Remote error code.
        code: String,
        /// Remote error message.
        message: String,
    },

    /// The exchange was cancelled.
    #[error("exchange cancelled")]
    Cancelled,
}

impl ExchangeError {
    /// Classifies a remote STS error by its code, falling back to the HTTP status.
    pub fn from_remote(code: Option<&str>, message: Option<&str>, http_status: Option<u16>) -> Self {
        let message = message.unwrap_or_default().to_owned();
        let Some(code) = code else {
            return match http_status {
                Some(429) => Self::Throttled(message),
                Some(s) if s >= 500 => Self::Unavailable(message),
                Some(s) => Self::Rejected {
                    code: format!("HTTP {s}"),
                    message,
                },
                None => Self::Unavailable(message),
            };
        };

        match code {
            "AccessDenied" | "AccessDeniedException" | "IDPRejectedClaim"
            | "RegionDisabledException" => Self::AccessDenied(message),
            "InvalidIdentityToken" | "ExpiredTokenException" | "ExpiredToken" => {
                Self::InvalidToken(message)
            }
            "Throttling" | "ThrottlingException" | "RequestLimitExceeded"
            | "TooManyRequestsException" | "PriorRequestNotComplete" => Self::Throttled(message),
            "IDPCommunicationError" | "ServiceUnavailable" | "InternalFailure" | "InternalError"
            | "RequestTimeout" | "RequestTimeoutException" => Self::Unavailable(message),
            _ => match http_status {
                Some(429) => Self::Throttled(message),
                Some(s) if s >= 500 => Self::Unavailable(message),
                _ => Self::Rejected {
                    code: code.to_owned(),
                    message,
                },
            },
        }
    }

    /// Returns `true` for transient failures worth retrying.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Unavailable(_))
    }

    /// Returns a stable, low-cardinality label for telemetry.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidDuration { .. } => "invalid_duration",
            Self::AccessDenied(_) => "access_denied",
            Self::InvalidToken(_) => "invalid_token",
            Self::Throttled(_) => "throttled",
            Self::Unavailable(_) => "unavailable",
            Self::Rejected { .. } => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}
