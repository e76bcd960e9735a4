//! Credential provider: the composition root.
//!
//! [`CredentialProvider`] ties a [`TokenSource`], an [`Exchanger`] and a
//! [`CredentialCache`] together behind [`CredentialProvider::current_credentials`].
//!
//! # Example
//!
//! ```no_run
//! use spiffe_aws_assume_role::{CredentialProvider, ProviderConfig, StsExchangeClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sdk_config = aws_config::load_from_env().await;
//! let config = ProviderConfig::new("sts.amazonaws.com", "arn:aws:iam::123456789012:role/demo");
//!
//! let provider = CredentialProvider::builder(config, Arc::new(StsExchangeClient::from_conf(&sdk_config)))
//!     .workload_socket("unix:/tmp/spire-agent/public/api.sock")
//!     .build()?;
//!
//! let creds = provider.current_credentials().await?;
//! println!("expires at {}", creds.expiration());
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheError, CacheState, CredentialCache, Lookup, RefreshPolicy, Source};
use crate::clock::{Clock, SystemClock};
use crate::credentials::CredentialSet;
use crate::error::{ConfigError, ProviderError};
use crate::exchange::{
    default_session_name, validate_role_arn, validate_session_duration, validate_session_name,
    ExchangeClient, ExchangeRequest, Exchanger, RetryConfig, DEFAULT_EXCHANGE_TIMEOUT,
};
use crate::prelude::{info, warn};
use crate::telemetry::{events, record_result, NoopTelemetry, Outcome, Telemetry};
use crate::token_source::{
    IdentityRequest, TokenSource, TokenSourceError, WorkloadApiTokenSource, DEFAULT_AGENT_TIMEOUT,
};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Immutable provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    audience: String,
    role_arn: String,
    session_name: Option<String>,
    session_duration: Option<Duration>,
    spiffe_id: Option<String>,
}

impl ProviderConfig {
    /// Creates a configuration for `audience` and `role_arn`.
    pub fn new(audience: impl Into<String>, role_arn: impl Into<String>) -> Self {
        Self {
            audience: audience.into(),
            role_arn: role_arn.into(),
            session_name: None,
            session_duration: None,
            spiffe_id: None,
        }
    }

    /// Sets the role session name. An empty name selects the default.
    #[must_use]
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into()).filter(|n| !n.is_empty());
        self
    }

    /// Sets the requested session duration.
    #[must_use]
    pub const fn with_session_duration(mut self, duration: Duration) -> Self {
        self.session_duration = Some(duration);
        self
    }

    /// Requests the JWT-SVID of a specific SPIFFE ID instead of the agent's default.
    #[must_use]
    pub fn with_spiffe_id(mut self, id: impl Into<String>) -> Self {
        self.spiffe_id = Some(id.into()).filter(|id| !id.is_empty());
        self
    }

    /// JWT-SVID audience.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Role to assume.
    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    /// Session name as configured. See [`CredentialProvider::session_name`] for the effective name.
    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    /// Requested session duration. `None` lets STS apply the role default.
    pub const fn session_duration(&self) -> Option<Duration> {
        self.session_duration
    }

    /// Requested SPIFFE ID, if any.
    pub fn spiffe_id(&self) -> Option<&str> {
        self.spiffe_id.as_deref()
    }

    /// Validates the configuration and builds the identity request it implies.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<IdentityRequest, ConfigError> {
        let request = IdentityRequest::new(self.audience.as_str(), self.spiffe_id.as_deref())?;
        validate_role_arn(&self.role_arn)?;
        if let Some(name) = &self.session_name {
            validate_session_name(name)?;
        }
        if let Some(duration) = self.session_duration {
            validate_session_duration(duration)?;
        }
        Ok(request)
    }
}

/// Builder for [`CredentialProvider`].
pub struct CredentialProviderBuilder {
    config: ProviderConfig,
    exchange_client: Arc<dyn ExchangeClient>,
    token_source: Option<Arc<dyn TokenSource>>,
    workload_socket: Option<String>,
    agent_timeout: Duration,
    exchange_timeout: Duration,
    retry: RetryConfig,
    refresh_policy: RefreshPolicy,
    telemetry: Option<Arc<dyn Telemetry>>,
    clock: Option<Arc<dyn Clock>>,
    cancel: Option<CancellationToken>,
}

impl Debug for CredentialProviderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProviderBuilder")
            .field("config", &self.config)
            .field("exchange_client", &self.exchange_client)
            .field(
                "token_source",
                &self.token_source.as_ref().map(|_| "<TokenSource>"),
            )
            .field("workload_socket", &self.workload_socket)
            .field("agent_timeout", &self.agent_timeout)
            .field("exchange_timeout", &self.exchange_timeout)
            .field("retry", &self.retry)
            .field("refresh_policy", &self.refresh_policy)
            .field("telemetry", &self.telemetry.as_ref().map(|_| "<Telemetry>"))
            .field("clock", &self.clock)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl CredentialProviderBuilder {
    /// Creates a builder exchanging tokens through `exchange_client`.
    pub fn new(config: ProviderConfig, exchange_client: Arc<dyn ExchangeClient>) -> Self {
        Self {
            config,
            exchange_client,
            token_source: None,
            workload_socket: None,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            retry: RetryConfig::default(),
            refresh_policy: RefreshPolicy::default(),
            telemetry: None,
            clock: None,
            cancel: None,
        }
    }

    /// Sets a custom token source. Overrides [`Self::workload_socket`].
    #[must_use]
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Sets the Workload API socket used by the default token source.
    ///
    /// Without it, `SPIFFE_ENDPOINT_SOCKET` is used.
    #[must_use]
    pub fn workload_socket(mut self, socket: impl Into<String>) -> Self {
        self.workload_socket = Some(socket.into());
        self
    }

    /// Sets the timeout for identity agent calls made by the default token source.
    #[must_use]
    pub const fn agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Sets the timeout for each STS attempt.
    #[must_use]
    pub const fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Sets the retry configuration for transient STS failures.
    #[must_use]
    pub const fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the refresh policy.
    #[must_use]
    pub const fn refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    /// Sets the telemetry sink.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets a cancellation token. Cancelling it aborts in-flight refreshes.
    #[must_use]
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validates the configuration and builds the provider.
    ///
    /// No collaborator is called.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] if the configuration is invalid.
    pub fn build(self) -> Result<CredentialProvider, ProviderError> {
        let request = self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(NoopTelemetry) as Arc<dyn Telemetry>);
        let cancel = self.cancel.unwrap_or_default();

        let token_source = self.token_source.unwrap_or_else(|| {
            Arc::new(
                WorkloadApiTokenSource::new(self.workload_socket)
                    .with_timeout(self.agent_timeout)
                    .with_clock(Arc::clone(&clock)),
            )
        });

        let exchanger = Exchanger::new(self.exchange_client)
            .with_retry(self.retry)
            .with_timeout(self.exchange_timeout)
            .with_clock(Arc::clone(&clock))
            .with_telemetry(Arc::clone(&telemetry))
            .with_cancellation(cancel.clone());

        let session_name = self
            .config
            .session_name
            .clone()
            .unwrap_or_else(|| default_session_name(&self.config.audience));

        Ok(CredentialProvider {
            inner: Arc::new(Inner {
                cache: CredentialCache::with_clock(self.refresh_policy, clock),
                config: self.config,
                session_name,
                request,
                token_source,
                exchanger,
                telemetry,
                cancel,
            }),
        })
    }
}

/// Provides AWS credentials for a SPIFFE identity, refreshing them as needed.
///
/// Cloning is cheap; clones share the cache.
#[derive(Clone)]
pub struct CredentialProvider {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProviderConfig,
    session_name: String,
    request: IdentityRequest,
    token_source: Arc<dyn TokenSource>,
    exchanger: Exchanger,
    telemetry: Arc<dyn Telemetry>,
    cache: CredentialCache<ProviderError>,
    cancel: CancellationToken,
}

impl Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("config", &self.inner.config)
            .field("session_name", &self.inner.session_name)
            .field("token_source", &self.inner.token_source)
            .field("exchanger", &self.inner.exchanger)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

impl CredentialProvider {
    /// Returns a builder. See [`CredentialProviderBuilder::new`].
    pub fn builder(
        config: ProviderConfig,
        exchange_client: Arc<dyn ExchangeClient>,
    ) -> CredentialProviderBuilder {
        CredentialProviderBuilder::new(config, exchange_client)
    }

    /// Returns the configuration this provider was built with.
    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    /// JWT-SVID audience.
    pub fn audience(&self) -> &str {
        self.inner.config.audience()
    }

    /// Role to assume.
    pub fn role_arn(&self) -> &str {
        self.inner.config.role_arn()
    }

    /// Effective role session name (configured or derived from the audience).
    pub fn session_name(&self) -> &str {
        &self.inner.session_name
    }

    /// Requested session duration.
    pub fn session_duration(&self) -> Option<Duration> {
        self.inner.config.session_duration()
    }

    /// Current cache state.
    pub fn cache_state(&self) -> CacheState {
        self.inner.cache.state()
    }

    /// Returns credentials, refreshing them if the cached set is missing or
    /// about to expire.
    ///
    /// Concurrent callers share one refresh. A `credentials` telemetry event
    /// is recorded for every call.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] naming the stage that failed.
    pub async fn current_credentials(&self) -> Result<Arc<CredentialSet>, ProviderError> {
        let start = Instant::now();
        let inner = Arc::clone(&self.inner);
        let result = self
            .inner
            .cache
            .get_or_refresh(move || async move { inner.refresh().await })
            .await;

        let (outcome, result) = match result {
            Ok(Lookup {
                credentials,
                source: Source::Stale(e),
            }) => {
                warn!(
                    "Serving previously issued credentials after refresh failure: stage={}, error={e}",
                    e.stage()
                );
                (Outcome::Stale(e.kind()), Ok(credentials))
            }
            Ok(lookup) => (Outcome::Success, Ok(lookup.credentials)),
            Err(CacheError::Refresh(e)) => (Outcome::Failure(e.kind()), Err(e)),
            Err(CacheError::Aborted) => {
                let e = ProviderError::RefreshAborted;
                (Outcome::Failure(e.kind()), Err(e))
            }
        };
        self.inner
            .telemetry
            .record_event(events::CREDENTIALS, outcome, start.elapsed());
        result
    }
}

impl Inner {
    async fn refresh(&self) -> Result<CredentialSet, ProviderError> {
        let start = Instant::now();
        let result = self.fetch_and_exchange().await;
        record_result(
            self.telemetry.as_ref(),
            events::REFRESH,
            &result,
            ProviderError::kind,
            start.elapsed(),
        );
        match &result {
            Ok(creds) => info!(
                "Obtained AWS credentials: role_arn={}, session_name={}, expiration={}",
                creds.role_arn(),
                creds.session_name(),
                creds.expiration()
            ),
            Err(e) => warn!(
                "Credential refresh failed: stage={}, error={e}",
                e.stage()
            ),
        }
        result
    }

    async fn fetch_and_exchange(&self) -> Result<CredentialSet, ProviderError> {
        let start = Instant::now();
        let token = tokio::select! {
            () = self.cancel.cancelled() => Err(TokenSourceError::Cancelled),
            r = self.token_source.fetch(&self.request) => r,
        };
        record_result(
            self.telemetry.as_ref(),
            events::FETCH_IDENTITY_TOKEN,
            &token,
            TokenSourceError::kind,
            start.elapsed(),
        );

        let request = ExchangeRequest::new(
            self.config.role_arn.as_str(),
            Some(self.session_name.as_str()),
            self.config.session_duration,
            token?,
        );
        Ok(self.exchanger.exchange(&request).await?)
    }
}
