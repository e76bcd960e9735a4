#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Exchanges SPIFFE JWT-SVIDs for temporary AWS credentials.
//!
//! A workload with a SPIFFE identity asks its local agent for a JWT-SVID,
//! trades it for role credentials with STS `AssumeRoleWithWebIdentity`, and
//! hands them to the AWS SDKs through the `credential_process` protocol.
//! No long-lived secret is involved.
//!
//! The pieces:
//!
//! - [`token_source`]: fetches a JWT-SVID for an audience from the SPIFFE Workload API.
//! - [`exchange`]: validates the request and calls STS with bounded retry for transient failures.
//! - [`cache`]: holds the current credentials and guarantees a single refresh in flight.
//! - [`provider`]: composes the above behind [`CredentialProvider::current_credentials`].
//! - [`process_creds`]: renders credentials as a `credential_process` document.
//!
//! # Example
//!
//! ```no_run
//! use spiffe_aws_assume_role::{process_creds, CredentialProvider, ProviderConfig, StsExchangeClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let sdk_config = aws_config::load_from_env().await;
//! let provider = CredentialProvider::builder(
//!     ProviderConfig::new("sts.amazonaws.com", "arn:aws:iam::123456789012:role/demo"),
//!     Arc::new(StsExchangeClient::from_conf(&sdk_config)),
//! )
//! .build()?;
//!
//! let creds = provider.current_credentials().await?;
//! let document = process_creds::render(&creds)?;
//! # let _ = document;
//! # Ok(())
//! # }
//! ```

mod observability;
mod prelude;

pub mod cache;
pub mod clock;
pub mod credentials;
pub mod duration;
pub mod error;
pub mod exchange;
pub mod process_creds;
pub mod provider;
pub mod telemetry;
pub mod token_source;

// -----------------------
// Re-exports
// -----------------------

pub use crate::cache::{CacheState, RefreshPolicy};
pub use crate::credentials::CredentialSet;
pub use crate::error::{ConfigError, ProviderError, Stage};
pub use crate::exchange::{ExchangeError, RetryConfig, StsExchangeClient};
pub use crate::process_creds::SerializationError;
pub use crate::provider::{CredentialProvider, CredentialProviderBuilder, ProviderConfig};
pub use crate::telemetry::{LogTelemetry, NoopTelemetry, Outcome, Telemetry};
pub use crate::token_source::{TokenSourceError, WorkloadApiTokenSource};
