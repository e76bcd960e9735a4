use super::errors::TokenSourceError;
use base64ct::{Base64UrlUnpadded, Encoding as _};
use serde::Deserialize;
use spiffe::{JwtSvid, SpiffeId};
use std::error::Error as _;
use std::fmt;
use time::OffsetDateTime;
use zeroize::Zeroizing;

/// A JWT-SVID bound to one audience.
///
/// Tokens are never cached by a token source: each fetch may return a newly
/// issued token. The serialized token is zeroized on drop and redacted from
/// `Debug` output.
///
/// ## Invariants
///
/// - `expiry` is strictly after `issued_at`.
/// - `audience` is one of the token's `aud` values.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken {
    token: Zeroizing<String>,
    audience: String,
    spiffe_id: SpiffeId,
    issued_at: OffsetDateTime,
    expiry: OffsetDateTime,
}

// `JwtSvid::expiry` is truncated to a date; the exact instants are read here.
#[derive(Deserialize)]
struct Timestamps {
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
}

impl IdentityToken {
    /// Parses `token` as returned by the identity agent and checks that it
    /// was issued for `audience`.
    ///
    /// The signature is **not** verified: the token comes from the local agent
    /// and is trusted by construction. STS performs the real verification.
    ///
    /// # Errors
    ///
    /// Returns [`TokenSourceError::MalformedToken`] if the token is not a
    /// JWT-SVID, or if any check of [`IdentityToken::from_svid`] fails.
    pub fn from_agent_token(
        token: &str,
        audience: &str,
        fetched_at: OffsetDateTime,
    ) -> Result<Self, TokenSourceError> {
        let svid = JwtSvid::parse_insecure(token).map_err(|e| invalid_svid(&e))?;
        Self::from_svid(&svid, audience, fetched_at)
    }

    /// Builds a token from a parsed JWT-SVID.
    ///
    /// When the token carries no `iat` claim, `fetched_at` is used as the
    /// issue time.
    ///
    /// # Errors
    ///
    /// Returns [`TokenSourceError::MalformedToken`] if:
    /// - `audience` is not among the `aud` values,
    /// - `exp` or `iat` cannot be read,
    /// - `exp` is not after the issue time.
    pub fn from_svid(
        svid: &JwtSvid,
        audience: &str,
        fetched_at: OffsetDateTime,
    ) -> Result<Self, TokenSourceError> {
        if !svid.audience().iter().any(|a| a == audience) {
            return Err(malformed(format!(
                "token audience {:?} does not include {audience:?}",
                svid.audience()
            )));
        }

        let stamps = read_timestamps(svid.token())?;
        let expiry = OffsetDateTime::from_unix_timestamp(stamps.exp)
            .map_err(|_| malformed("invalid 'exp' claim"))?;
        let issued_at = match stamps.iat {
            Some(iat) => OffsetDateTime::from_unix_timestamp(iat)
                .map_err(|_| malformed("invalid 'iat' claim"))?,
            None => fetched_at,
        };
        if expiry <= issued_at {
            return Err(malformed("token expires before it was issued"));
        }

        Ok(Self {
            token: Zeroizing::new(svid.token().to_owned()),
            audience: audience.to_owned(),
            spiffe_id: svid.spiffe_id().clone(),
            issued_at,
            expiry,
        })
    }

    /// Returns the serialized JWT.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the audience the token was requested for.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Returns the workload's SPIFFE ID (the `sub` claim).
    pub const fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Returns the issue time.
    pub const fn issued_at(&self) -> OffsetDateTime {
        self.issued_at
    }

    /// Returns the expiry time.
    pub const fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityToken")
            .field("token", &"<redacted>")
            .field("audience", &self.audience)
            .field("spiffe_id", &self.spiffe_id)
            .field("issued_at", &self.issued_at)
            .field("expiry", &self.expiry)
            .finish()
    }
}

fn malformed(msg: impl Into<String>) -> TokenSourceError {
    TokenSourceError::MalformedToken(msg.into())
}

pub(super) fn invalid_svid(e: &spiffe::JwtSvidError) -> TokenSourceError {
    match e.source() {
        Some(cause) => malformed(format!("{e}: {cause}")),
        None => malformed(e.to_string()),
    }
}

// Only called on tokens `JwtSvid` already decoded, so the payload segment exists.
fn read_timestamps(token: &str) -> Result<Timestamps, TokenSourceError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| malformed("token is not a 3-part JWT"))?;
    let json = Base64UrlUnpadded::decode_vec(payload)
        .map_err(|_| malformed("claims are not valid base64url"))?;
    serde_json::from_slice(&json).map_err(|e| malformed(format!("invalid claims: {e}")))
}
