//! Identity token acquisition.
//!
//! A [`TokenSource`] obtains a JWT-SVID for one audience from a local
//! identity agent. [`WorkloadApiTokenSource`] talks to the SPIFFE Workload API;
//! tests substitute their own implementation.
//!
//! Requests are validated when the [`IdentityRequest`] is built, so a request
//! that reaches a token source is always well-formed.

mod errors;
mod token;
mod workload;

pub use errors::TokenSourceError;
pub use token::IdentityToken;
pub use workload::{WorkloadApiTokenSource, DEFAULT_AGENT_TIMEOUT};

use crate::clock::BoxFuture;
use crate::error::ConfigError;
use spiffe::spiffe_id::SpiffeId;
use std::fmt::Debug;

/// A validated request for an identity token.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRequest {
    audience: String,
    spiffe_id: Option<SpiffeId>,
}

impl IdentityRequest {
    /// Builds a request for `audience`, optionally selecting the identity `hint`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyAudience`] if `audience` is empty, or
    /// [`ConfigError::InvalidSpiffeId`] if `hint` is not a valid SPIFFE ID.
    pub fn new(audience: impl Into<String>, hint: Option<&str>) -> Result<Self, ConfigError> {
        let audience = audience.into();
        if audience.trim().is_empty() {
            return Err(ConfigError::EmptyAudience);
        }

        let spiffe_id = hint
            .map(|id| {
                SpiffeId::new(id).map_err(|e| ConfigError::InvalidSpiffeId {
                    id: id.to_owned(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            audience,
            spiffe_id,
        })
    }

    /// Returns the requested audience.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Returns the requested identity, if any.
    pub fn spiffe_id(&self) -> Option<&SpiffeId> {
        self.spiffe_id.as_ref()
    }
}

/// Source of freshly signed identity tokens.
pub trait TokenSource: Send + Sync + Debug {
    /// Fetches a token for `request`.
    ///
    /// Implementations must not cache tokens.
    fn fetch<'a>(
        &'a self,
        request: &'a IdentityRequest,
    ) -> BoxFuture<'a, Result<IdentityToken, TokenSourceError>>;
}

#[cfg(test)]
pub(crate) mod tests_support {
    pub(crate) use super::token::tests::jwt_with_claims as jwt;
}
