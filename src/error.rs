//! Error types shared across the credential pipeline.

use crate::exchange::ExchangeError;
use crate::token_source::TokenSourceError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Invalid input detected before any network call is made.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The JWT-SVID audience is empty.
    #[error("audience must not be empty")]
    EmptyAudience,

    /// The role ARN is empty.
    #[error("role ARN must not be empty")]
    EmptyRoleArn,

    /// The role ARN is not an IAM role ARN.
    #[error("invalid IAM role ARN: {0}")]
    InvalidRoleArn(String),

    /// The role session name does not satisfy the STS constraints.
    #[error("invalid role session name: {0}")]
    InvalidSessionName(String),

    /// The requested session duration is outside the STS bounds.
    #[error("session duration {}s is outside the allowed range {}s..={}s", .requested.as_secs(), .min.as_secs(), .max.as_secs())]
    SessionDurationOutOfRange {
        /// The requested duration.
        requested: Duration,
        /// Minimum allowed duration.
        min: Duration,
        /// Maximum allowed duration.
        max: Duration,
    },

    /// The SPIFFE ID hint is not a valid SPIFFE ID.
    #[error("invalid SPIFFE ID {id:?}: {reason}")]
    InvalidSpiffeId {
        /// The rejected input.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Pipeline stage that produced a [`ProviderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Provider configuration validation.
    Configuration,
    /// Fetching the JWT-SVID from the identity agent.
    Identity,
    /// Exchanging the JWT-SVID with STS.
    Exchange,
    /// The refresh task ended without producing a result.
    Refresh,
}

impl Stage {
    /// Returns a stable label for logs and telemetry.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Identity => "identity",
            Self::Exchange => "exchange",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`CredentialProvider`](crate::CredentialProvider).
///
/// Each variant names the stage that failed so operators can tell an agent
/// outage from an IAM trust-policy problem.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider was constructed with invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    /// Fetching the identity token failed.
    #[error("failed to fetch identity token: {0}")]
    Identity(#[from] TokenSourceError),

    /// Exchanging the identity token for credentials failed.
    #[error("failed to exchange identity token for AWS credentials: {0}")]
    Exchange(#[from] ExchangeError),

    /// The in-flight refresh terminated without publishing a result.
    #[error("credential refresh aborted")]
    RefreshAborted,
}

impl ProviderError {
    /// Returns the stage that failed.
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Configuration(_) => Stage::Configuration,
            Self::Identity(_) => Stage::Identity,
            Self::Exchange(_) => Stage::Exchange,
            Self::RefreshAborted => Stage::Refresh,
        }
    }

    /// Returns a stable, low-cardinality label describing the failure.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Identity(e) => e.kind(),
            Self::Exchange(e) => e.kind(),
            Self::RefreshAborted => "refresh_aborted",
        }
    }
}
