//! Federated credential exchange.
//!
//! [`Exchanger`] trades an identity token for temporary AWS credentials
//! through an [`ExchangeClient`]. It validates the request locally, then
//! performs the remote call inside a bounded retry loop for transient
//! failures (throttling, unavailability, timeouts). Every other remote error
//! is returned after the first attempt.

mod errors;
mod sts;

pub use errors::ExchangeError;
pub use sts::StsExchangeClient;

use crate::clock::{next_backoff, sleep_or_cancel, BoxFuture, Clock, SystemClock};
use crate::credentials::CredentialSet;
use crate::error::ConfigError;
use crate::prelude::{debug, warn};
use crate::telemetry::{events, record_result, NoopTelemetry, Telemetry};
use crate::token_source::IdentityToken;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Shortest session STS grants for a web-identity role.
pub const MIN_SESSION_DURATION: Duration = Duration::from_secs(15 * 60);

/// Longest session STS grants for a web-identity role.
pub const MAX_SESSION_DURATION: Duration = Duration::from_secs(12 * 60 * 60);

/// Default bound on each STS call.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

const SESSION_NAME_MIN_LEN: usize = 2;
const SESSION_NAME_MAX_LEN: usize = 64;

/// One exchange of an identity token for credentials.
///
/// Built fresh for every refresh; the [`Exchanger`] borrows it for each attempt.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    /// Role to assume.
    pub role_arn: String,
    /// Role session name recorded in CloudTrail.
    pub session_name: String,
    /// Requested session duration. `None` lets STS apply the role default.
    pub duration: Option<Duration>,
    /// Proof of identity.
    pub token: IdentityToken,
}

impl ExchangeRequest {
    /// Builds a request, deriving the session name from the token audience when
    /// `session_name` is `None` or empty.
    pub fn new(
        role_arn: impl Into<String>,
        session_name: Option<&str>,
        duration: Option<Duration>,
        token: IdentityToken,
    ) -> Self {
        let session_name = match session_name.filter(|s| !s.is_empty()) {
            Some(s) => s.to_owned(),
            None => default_session_name(token.audience()),
        };
        Self {
            role_arn: role_arn.into(),
            session_name,
            duration,
            token,
        }
    }

    /// Returns the token audience.
    pub fn audience(&self) -> &str {
        self.token.audience()
    }
}

/// Validates an IAM role ARN (`arn:<partition>:iam::<account>:role/<path/name>`).
///
/// # Errors
///
/// Returns [`ConfigError::EmptyRoleArn`] or [`ConfigError::InvalidRoleArn`].
pub fn validate_role_arn(arn: &str) -> Result<(), ConfigError> {
    if arn.is_empty() {
        return Err(ConfigError::EmptyRoleArn);
    }
    let invalid = || ConfigError::InvalidRoleArn(arn.to_owned());

    let mut parts = arn.splitn(6, ':');
    let (Some("arn"), Some(partition), Some("iam"), Some(""), Some(account), Some(resource)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(invalid());
    };

    if partition.is_empty() || !partition.chars().all(|c| c.is_ascii_lowercase() || c == '-') {
        return Err(invalid());
    }
    if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let name = resource.strip_prefix("role/").ok_or_else(invalid)?;
    if name.is_empty()
        || name.ends_with('/')
        || !name.chars().all(|c| is_iam_name_char(c) || c == '/')
    {
        return Err(invalid());
    }
    Ok(())
}

/// Validates a role session name: 2 to 64 characters from `[\w+=,.@-]`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidSessionName`].
pub fn validate_session_name(name: &str) -> Result<(), ConfigError> {
    let len = name.chars().count();
    if !(SESSION_NAME_MIN_LEN..=SESSION_NAME_MAX_LEN).contains(&len)
        || !name.chars().all(is_iam_name_char)
    {
        return Err(ConfigError::InvalidSessionName(name.to_owned()));
    }
    Ok(())
}

/// Checks `duration` against [`MIN_SESSION_DURATION`] and [`MAX_SESSION_DURATION`].
///
/// # Errors
///
/// Returns [`ConfigError::SessionDurationOutOfRange`].
pub fn validate_session_duration(duration: Duration) -> Result<(), ConfigError> {
    if !(MIN_SESSION_DURATION..=MAX_SESSION_DURATION).contains(&duration) {
        return Err(ConfigError::SessionDurationOutOfRange {
            requested: duration,
            min: MIN_SESSION_DURATION,
            max: MAX_SESSION_DURATION,
        });
    }
    Ok(())
}

/// Derives a session name from `audience`.
///
/// Characters STS does not accept become `-`, the result is capped at 64
/// characters, and names shorter than 2 characters get a `spiffe-` prefix.
/// The same audience always yields the same name.
pub fn default_session_name(audience: &str) -> String {
    let mut name: String = audience
        .chars()
        .map(|c| if is_iam_name_char(c) { c } else { '-' })
        .take(SESSION_NAME_MAX_LEN)
        .collect();
    if name.chars().count() < SESSION_NAME_MIN_LEN {
        name = format!("spiffe-{name}");
    }
    name
}

fn is_iam_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '=' | ',' | '.' | '@' | '-')
}

/// Remote side of the exchange: one `AssumeRoleWithWebIdentity`-style call.
///
/// Implementations classify remote failures into [`ExchangeError`] (see
/// [`ExchangeError::from_remote`]) and must take the credential expiry from the
/// remote response.
pub trait ExchangeClient: Send + Sync + Debug {
    /// Performs a single attempt.
    fn assume_role_with_token<'a>(
        &'a self,
        request: &'a ExchangeRequest,
    ) -> BoxFuture<'a, Result<CredentialSet, ExchangeError>>;
}

/// Bounded retry configuration for transient exchange failures.
///
/// If `min_backoff > max_backoff`, they are swapped; `max_attempts` is at least 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub min_backoff: Duration,
    /// Maximum delay between retries.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub(crate) fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self.max_attempts = self.max_attempts.max(1);
        self
    }
}

/// Exchanges identity tokens for credentials with bounded retry.
#[derive(Clone)]
pub struct Exchanger {
    client: Arc<dyn ExchangeClient>,
    retry: RetryConfig,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
    cancel: CancellationToken,
}

impl Debug for Exchanger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchanger")
            .field("client", &self.client)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("clock", &self.clock)
            .field("telemetry", &self.telemetry)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl Exchanger {
    /// Creates an exchanger with default retry, timeout, clock and no telemetry.
    pub fn new(client: Arc<dyn ExchangeClient>) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(NoopTelemetry),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry.normalize();
        self
    }

    /// Sets the per-attempt timeout. A timed-out attempt counts as [`ExchangeError::Unavailable`].
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the clock used for backoff sleeps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the telemetry sink. One `exchange_attempt` event is recorded per attempt.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets the cancellation token observed between and during attempts.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the retry configuration.
    pub const fn retry(&self) -> RetryConfig {
        self.retry
    }

    /// Exchanges `request.token` for credentials.
    ///
    /// # Errors
    ///
    /// - [`ExchangeError::Configuration`] or [`ExchangeError::InvalidDuration`]
    ///   for invalid requests, without calling the client;
    /// - the last transient error once `max_attempts` is reached;
    /// - any non-transient error immediately;
    /// - [`ExchangeError::Cancelled`] if cancelled.
    pub async fn exchange(&self, request: &ExchangeRequest) -> Result<CredentialSet, ExchangeError> {
        validate_role_arn(&request.role_arn)?;
        validate_session_name(&request.session_name)?;
        if let Some(d) = request.duration {
            if validate_session_duration(d).is_err() {
                return Err(ExchangeError::InvalidDuration { requested: d });
            }
        }

        let mut backoff = self.retry.min_backoff;
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ExchangeError::Cancelled);
            }
            attempt += 1;

            let start = Instant::now();
            let result = self.attempt(request).await;
            record_result(
                self.telemetry.as_ref(),
                events::EXCHANGE_ATTEMPT,
                &result,
                ExchangeError::kind,
                start.elapsed(),
            );

            match result {
                Ok(creds) => {
                    debug!(
                        "Exchanged identity token: role_arn={}, session_name={}, attempt={attempt}",
                        request.role_arn, request.session_name
                    );
                    return Ok(creds);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        "Transient STS failure; retrying: error={e}, attempt={attempt}, backoff_ms={}",
                        backoff.as_millis()
                    );
                    if sleep_or_cancel(self.clock.as_ref(), &self.cancel, backoff).await {
                        return Err(ExchangeError::Cancelled);
                    }
                    backoff = next_backoff(backoff, self.retry.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, request: &ExchangeRequest) -> Result<CredentialSet, ExchangeError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(ExchangeError::Cancelled),
            r = tokio::time::timeout(self.timeout, self.client.assume_role_with_token(request)) => {
                r.unwrap_or_else(|_| Err(ExchangeError::Unavailable(format!(
                    "no response within {}ms",
                    self.timeout.as_millis()
                ))))
            }
        }
    }
}
