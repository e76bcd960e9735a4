//! Deterministic collaborators shared by the integration tests.

#![allow(dead_code)]

use base64ct::{Base64UrlUnpadded, Encoding};
use spiffe_aws_assume_role::clock::{BoxFuture, Clock};
use spiffe_aws_assume_role::exchange::{ExchangeClient, ExchangeRequest};
use spiffe_aws_assume_role::telemetry::{Outcome, Telemetry};
use spiffe_aws_assume_role::token_source::{
    IdentityRequest, IdentityToken, TokenSource, TokenSourceError,
};
use spiffe_aws_assume_role::{CredentialSet, ExchangeError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::Notify;

pub const AUDIENCE: &str = "sts.amazonaws.com";
pub const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/demo";

/// Clock that only moves when told to; sleeps complete immediately.
#[derive(Debug, Default)]
pub struct ManualClock {
    offset_secs: AtomicI64,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.offset_secs
            .fetch_add(i64::try_from(by.as_secs()).unwrap(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        datetime!(2030-01-01 0:00 UTC)
            + time::Duration::seconds(self.offset_secs.load(Ordering::SeqCst))
    }

    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

pub fn jwt(sub: &str, aud: &str, iat: i64, exp: i64) -> String {
    let header = Base64UrlUnpadded::encode_string(br#"{"alg":"ES256","kid":"k1","typ":"JWT"}"#);
    let claims = Base64UrlUnpadded::encode_string(
        format!(r#"{{"sub":"{sub}","aud":["{aud}"],"iat":{iat},"exp":{exp}}}"#).as_bytes(),
    );
    format!("{header}.{claims}.c2lnbmF0dXJl")
}

/// Token source answering from the manual clock, or failing with a fixed error.
#[derive(Debug)]
pub struct StubTokenSource {
    pub clock: Arc<ManualClock>,
    pub calls: AtomicU32,
    pub failure: Option<TokenSourceError>,
}

impl StubTokenSource {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            calls: AtomicU32::new(0),
            failure: None,
        })
    }

    pub fn failing(clock: Arc<ManualClock>, failure: TokenSourceError) -> Arc<Self> {
        Arc::new(Self {
            clock,
            calls: AtomicU32::new(0),
            failure: Some(failure),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenSource for StubTokenSource {
    fn fetch<'a>(
        &'a self,
        request: &'a IdentityRequest,
    ) -> BoxFuture<'a, Result<IdentityToken, TokenSourceError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match &self.failure {
            Some(e) => Err(e.clone()),
            None => {
                let now = self.clock.now();
                let iat = now.unix_timestamp();
                let token = jwt("spiffe://example.org/app", request.audience(), iat, iat + 300);
                IdentityToken::from_agent_token(&token, request.audience(), now)
            }
        };
        Box::pin(async move { result })
    }
}

/// Token source that never answers.
#[derive(Debug, Default)]
pub struct HangingTokenSource;

impl TokenSource for HangingTokenSource {
    fn fetch<'a>(
        &'a self,
        _request: &'a IdentityRequest,
    ) -> BoxFuture<'a, Result<IdentityToken, TokenSourceError>> {
        Box::pin(std::future::pending())
    }
}

/// Exchange client replaying a script of errors, then issuing one-hour credentials.
#[derive(Debug)]
pub struct ScriptedExchange {
    clock: Arc<ManualClock>,
    script: Mutex<VecDeque<ExchangeError>>,
    gate: Option<Arc<Notify>>,
    attempts: AtomicU32,
    issued: AtomicU32,
    requested: Mutex<Vec<Option<Duration>>>,
}

impl ScriptedExchange {
    pub fn new(clock: Arc<ManualClock>, errors: Vec<ExchangeError>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            script: Mutex::new(errors.into()),
            gate: None,
            attempts: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            requested: Mutex::new(Vec::new()),
        })
    }

    /// Every attempt waits for `gate` before answering.
    pub fn gated(clock: Arc<ManualClock>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            script: Mutex::new(VecDeque::new()),
            gate: Some(gate),
            attempts: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn push_error(&self, e: ExchangeError) {
        self.script.lock().unwrap().push_back(e);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Session durations asked for, one per attempt.
    pub fn requested_durations(&self) -> Vec<Option<Duration>> {
        self.requested.lock().unwrap().clone()
    }
}

impl ExchangeClient for ScriptedExchange {
    fn assume_role_with_token<'a>(
        &'a self,
        request: &'a ExchangeRequest,
    ) -> BoxFuture<'a, Result<CredentialSet, ExchangeError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(request.duration);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(e) = self.script.lock().unwrap().pop_front() {
                return Err(e);
            }
            let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CredentialSet::new(
                format!("AKIA{serial:04}"),
                format!("secret-{serial}"),
                format!("token-{serial}"),
                self.clock.now() + time::Duration::hours(1),
                request.role_arn.as_str(),
                request.session_name.as_str(),
            ))
        })
    }
}

/// Telemetry sink that keeps every event and label.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    pub events: Mutex<Vec<(String, Outcome)>>,
    pub labels: Mutex<Vec<(String, String)>>,
}

impl RecordingTelemetry {
    pub fn outcomes(&self, name: &str) -> Vec<Outcome> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, o)| *o)
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn record_event(&self, name: &str, outcome: Outcome, _elapsed: Duration) {
        self.events.lock().unwrap().push((name.to_owned(), outcome));
    }

    fn add_label(&self, key: &str, value: &str) {
        self.labels
            .lock()
            .unwrap()
            .push((key.to_owned(), value.to_owned()));
    }
}
