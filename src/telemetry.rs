//! Observability sink.
//!
//! The provider reports what happened on the refresh path through a
//! [`Telemetry`] implementation. Sinks observe; they never influence control
//! flow or return values.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Mutex;
use std::time::Duration;

/// Stable event names.
pub mod events {
    /// One call to the identity agent.
    pub const FETCH_IDENTITY_TOKEN: &str = "fetch_identity_token";
    /// One STS `AssumeRoleWithWebIdentity` attempt.
    pub const EXCHANGE_ATTEMPT: &str = "exchange_attempt";
    /// One full refresh (token fetch plus exchange, including retries).
    pub const REFRESH: &str = "refresh";
    /// One `current_credentials` call, whether served from cache or not.
    pub const CREDENTIALS: &str = "credentials";
}

/// Result of an observed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The operation succeeded.
    Success,
    /// The operation failed; the payload is a stable error label.
    Failure(&'static str),
    /// A refresh failed and previously cached credentials were served instead.
    Stale(&'static str),
}

impl Outcome {
    /// Returns a stable string for the outcome class.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(_) => "failure",
            Self::Stale(_) => "stale",
        }
    }

    /// Returns the error label for failures and stale serves.
    pub const fn error_kind(self) -> Option<&'static str> {
        match self {
            Self::Success => None,
            Self::Failure(kind) | Self::Stale(kind) => Some(kind),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_kind() {
            Some(kind) => write!(f, "{}({kind})", self.as_str()),
            None => f.write_str(self.as_str()),
        }
    }
}

/// Capability for recording structured events.
///
/// Implementations must be cheap and must not panic.
pub trait Telemetry: Send + Sync + Debug {
    /// Records a completed operation.
    fn record_event(&self, name: &str, outcome: Outcome, elapsed: Duration);

    /// Attaches a label to every subsequently recorded event.
    fn add_label(&self, key: &str, value: &str);
}

/// Records an event for `result`, labelling failures with `kind`.
pub(crate) fn record_result<T, E>(
    telemetry: &dyn Telemetry,
    name: &str,
    result: &Result<T, E>,
    kind: impl FnOnce(&E) -> &'static str,
    elapsed: Duration,
) {
    let outcome = match result {
        Ok(_) => Outcome::Success,
        Err(e) => Outcome::Failure(kind(e)),
    };
    telemetry.record_event(name, outcome, elapsed);
}

/// A [`Telemetry`] that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record_event(&self, _name: &str, _outcome: Outcome, _elapsed: Duration) {}
    fn add_label(&self, _key: &str, _value: &str) {}
}

// With `tracing`, fields are attached to the event; otherwise they are
// formatted into the message of the crate's logging facade.
macro_rules! log_record {
    ($level:ident, $name:expr, $outcome:expr, $elapsed_ms:expr, $service:expr, $labels:expr) => {{
        #[cfg(feature = "tracing")]
        tracing::$level!(
            event = $name,
            outcome = %$outcome,
            elapsed_ms = $elapsed_ms,
            service = $service,
            labels = ?$labels,
            "telemetry event"
        );

        #[cfg(not(feature = "tracing"))]
        crate::prelude::$level!(
            "telemetry event: event={} outcome={} elapsed_ms={} service={} labels={:?}",
            $name,
            $outcome,
            $elapsed_ms,
            $service,
            $labels
        );
    }};
}

/// A [`Telemetry`] that writes each event as a log record.
///
/// Successful events are logged at INFO, failures and stale serves at WARN.
#[derive(Default)]
pub struct LogTelemetry {
    service: Option<String>,
    labels: Mutex<BTreeMap<String, String>>,
}

impl LogTelemetry {
    /// Creates a sink with no service name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that tags every event with `service`.
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            labels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns a snapshot of the current labels.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.labels
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}

impl Debug for LogTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogTelemetry")
            .field("service", &self.service)
            .field("labels", &self.labels())
            .finish()
    }
}

impl Telemetry for LogTelemetry {
    fn record_event(&self, name: &str, outcome: Outcome, elapsed: Duration) {
        let service = self.service.as_deref().unwrap_or("-");
        let labels = self.labels();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Outcome::Success => log_record!(info, name, outcome, elapsed_ms, service, labels),
            Outcome::Failure(_) | Outcome::Stale(_) => {
                log_record!(warn, name, outcome, elapsed_ms, service, labels)
            }
        }
    }

    fn add_label(&self, key: &str, value: &str) {
        if let Ok(mut labels) = self.labels.lock() {
            labels.insert(key.to_owned(), value.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(
            Outcome::Failure("access_denied").to_string(),
            "failure(access_denied)"
        );
        assert_eq!(Outcome::Stale("throttled").error_kind(), Some("throttled"));
    }

    #[test]
    fn test_log_telemetry_keeps_labels() {
        let t = LogTelemetry::with_service("spiffe-aws-assume-role");
        t.add_label("stsRegion", "us-west-2");
        t.add_label("stsRegion", "eu-west-1");
        t.record_event(events::REFRESH, Outcome::Success, Duration::from_millis(3));

        let labels = t.labels();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["stsRegion"], "eu-west-1");
    }

    #[test]
    fn test_record_result_maps_error_kind() {
        #[derive(Debug, Default)]
        struct Capture(Mutex<Vec<Outcome>>);
        impl Telemetry for Capture {
            fn record_event(&self, _name: &str, outcome: Outcome, _elapsed: Duration) {
                self.0.lock().unwrap().push(outcome);
            }
            fn add_label(&self, _key: &str, _value: &str) {}
        }

        let capture = Capture::default();
        let ok: Result<(), &str> = Ok(());
        let err: Result<(), &str> = Err("boom");
        record_result(&capture, "x", &ok, |_| "unused", Duration::ZERO);
        record_result(&capture, "x", &err, |_| "boom", Duration::ZERO);

        assert_eq!(
            *capture.0.lock().unwrap(),
            vec![Outcome::Success, Outcome::Failure("boom")]
        );
    }
}
