//! Temporary AWS credentials.

use std::fmt;
use time::OffsetDateTime;
use zeroize::Zeroizing;

/// A set of temporary AWS credentials returned by a federated exchange.
///
/// The value is immutable. The secret access key and session token are
/// zeroized on drop and redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    access_key_id: String,
    secret_access_key: Zeroizing<String>,
    session_token: Zeroizing<String>,
    expiration: OffsetDateTime,
    role_arn: String,
    session_name: String,
}

impl CredentialSet {
    /// Creates a credential set.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        expiration: OffsetDateTime,
        role_arn: impl Into<String>,
        session_name: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            session_token: Zeroizing::new(session_token.into()),
            expiration,
            role_arn: role_arn.into(),
            session_name: session_name.into(),
        }
    }

    /// Returns the access key id.
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Returns the secret access key.
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    /// Returns the session token.
    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Returns the expiration reported by STS.
    pub const fn expiration(&self) -> OffsetDateTime {
        self.expiration
    }

    /// Returns the ARN of the role these credentials were issued for.
    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    /// Returns the role session name.
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Time left until expiration, measured from `now`. Negative once expired.
    pub fn remaining(&self, now: OffsetDateTime) -> time::Duration {
        self.expiration - now
    }

    /// Returns `true` if the credentials have expired at `now`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expiration
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .field("role_arn", &self.role_arn)
            .field("session_name", &self.session_name)
            .finish()
    }
}
