//! Rendering for the AWS `credential_process` protocol.
//!
//! The output is one line of JSON:
//!
//! ```text
//! {"Version":1,"AccessKeyId":"...","SecretAccessKey":"...","SessionToken":"...","Expiration":"2030-01-01T01:00:00Z"}
//! ```

use crate::credentials::CredentialSet;
use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use zeroize::Zeroizing;

/// Schema version of the `credential_process` document.
pub const PROCESS_CREDENTIALS_VERSION: u8 = 1;

/// Errors returned by [`render`].
///
/// These indicate a broken invariant upstream; valid credentials always render.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SerializationError {
    /// A required field is empty.
    #[error("required field {0} is empty")]
    MissingField(&'static str),

    /// The expiration cannot be expressed as an RFC 3339 timestamp.
    #[error("expiration cannot be formatted: {0}")]
    Expiration(String),

    /// JSON encoding failed.
    #[error("failed to encode credentials: {0}")]
    Encode(String),
}

// Field order is the wire order.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessCredentials<'a> {
    version: u8,
    access_key_id: &'a str,
    secret_access_key: &'a str,
    session_token: &'a str,
    expiration: &'a str,
}

/// Renders `creds` as a `credential_process` JSON document, without a trailing newline.
///
/// The output is deterministic and is wiped from memory when dropped.
///
/// # Errors
///
/// Returns [`SerializationError`] if a required field is empty.
pub fn render(creds: &CredentialSet) -> Result<Zeroizing<Vec<u8>>, SerializationError> {
    for (name, value) in [
        ("AccessKeyId", creds.access_key_id()),
        ("SecretAccessKey", creds.secret_access_key()),
        ("SessionToken", creds.session_token()),
    ] {
        if value.is_empty() {
            return Err(SerializationError::MissingField(name));
        }
    }

    let expiration = creds
        .expiration()
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|e| SerializationError::Expiration(e.to_string()))?;

    let doc = ProcessCredentials {
        version: PROCESS_CREDENTIALS_VERSION,
        access_key_id: creds.access_key_id(),
        secret_access_key: creds.secret_access_key(),
        session_token: creds.session_token(),
        expiration: &expiration,
    };

    serde_json::to_vec(&doc)
        .map(Zeroizing::new)
        .map_err(|e| SerializationError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    fn creds() -> CredentialSet {
        CredentialSet::new(
            "AKIAEXAMPLE",
            "secret",
            "tok",
            datetime!(2030-01-01 1:00 UTC),
            "arn:aws:iam::123456789012:role/demo",
            "demo",
        )
    }

    #[test]
    fn test_renders_fixed_document() {
        let out = render(&creds()).unwrap();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            r#"{"Version":1,"AccessKeyId":"AKIAEXAMPLE","SecretAccessKey":"secret","SessionToken":"tok","Expiration":"2030-01-01T01:00:00Z"}"#
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let first = render(&creds()).unwrap();
        for _ in 0..10 {
            assert_eq!(*render(&creds()).unwrap(), *first);
        }
        assert!(!first.contains(&b'\n'));
    }

    #[test]
    fn test_expiration_is_normalized_to_utc() {
        let c = CredentialSet::new(
            "AKIA",
            "secret",
            "tok",
            datetime!(2030-01-01 3:00 +02:00).to_offset(offset!(+2)),
            "arn:aws:iam::123456789012:role/demo",
            "demo",
        );
        let out = render(&c).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["Expiration"], "2030-01-01T01:00:00Z");
        assert_eq!(value["Version"], 1);
    }

    #[test]
    fn test_empty_required_field_is_an_error() {
        let c = CredentialSet::new(
            "AKIA",
            "",
            "tok",
            datetime!(2030-01-01 1:00 UTC),
            "arn:aws:iam::123456789012:role/demo",
            "demo",
        );
        assert_eq!(
            render(&c).unwrap_err(),
            SerializationError::MissingField("SecretAccessKey")
        );
    }
}
