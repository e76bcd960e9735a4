//! Integration tests for `CredentialProvider`.
//!
//! The identity agent and STS are replaced by the stubs in `common`, and
//! time is driven by a manual clock. No test touches the network.

mod common;

use common::{
    HangingTokenSource, ManualClock, RecordingTelemetry, ScriptedExchange, StubTokenSource,
    AUDIENCE, ROLE_ARN,
};
use spiffe_aws_assume_role::telemetry::events;
use spiffe_aws_assume_role::token_source::TokenSourceError;
use spiffe_aws_assume_role::{
    process_creds, CacheState, ConfigError, CredentialProvider, ExchangeError, Outcome,
    ProviderConfig, ProviderError, RefreshPolicy, Stage,
};
use std::sync::Arc;
use spiffe_aws_assume_role::clock::Clock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    clock: Arc<ManualClock>,
    tokens: Arc<StubTokenSource>,
    sts: Arc<ScriptedExchange>,
    telemetry: Arc<RecordingTelemetry>,
    provider: CredentialProvider,
}

fn harness(errors: Vec<ExchangeError>, policy: RefreshPolicy) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let tokens = StubTokenSource::new(Arc::clone(&clock));
    let sts = ScriptedExchange::new(Arc::clone(&clock), errors);
    let telemetry = Arc::new(RecordingTelemetry::default());

    let provider = CredentialProvider::builder(ProviderConfig::new(AUDIENCE, ROLE_ARN), sts.clone())
        .token_source(tokens.clone())
        .clock(clock.clone())
        .telemetry(telemetry.clone())
        .refresh_policy(policy)
        .build()
        .unwrap();

    Harness {
        clock,
        tokens,
        sts,
        telemetry,
        provider,
    }
}

#[tokio::test]
async fn test_access_denied_is_not_retried() {
    let h = harness(
        vec![ExchangeError::AccessDenied("not authorized".into())],
        RefreshPolicy::default(),
    );

    let err = h.provider.current_credentials().await.unwrap_err();

    assert!(matches!(err, ProviderError::Exchange(ExchangeError::AccessDenied(_))));
    assert_eq!(err.stage(), Stage::Exchange);
    assert_eq!(h.sts.attempts(), 1);
    assert_eq!(h.provider.cache_state(), CacheState::Empty);
    assert_eq!(
        h.telemetry.outcomes(events::CREDENTIALS),
        vec![Outcome::Failure("access_denied")]
    );
}

#[tokio::test]
async fn test_throttling_is_retried_until_success() {
    let h = harness(
        vec![
            ExchangeError::Throttled("rate exceeded".into()),
            ExchangeError::Throttled("rate exceeded".into()),
            ExchangeError::Throttled("rate exceeded".into()),
        ],
        RefreshPolicy::default(),
    );

    let creds = h.provider.current_credentials().await.unwrap();

    assert_eq!(creds.access_key_id(), "AKIA0001");
    assert_eq!(h.sts.attempts(), 4);
    assert_eq!(h.tokens.calls(), 1);
    assert_eq!(
        h.telemetry.outcomes(events::EXCHANGE_ATTEMPT),
        vec![
            Outcome::Failure("throttled"),
            Outcome::Failure("throttled"),
            Outcome::Failure("throttled"),
            Outcome::Success,
        ]
    );
    assert_eq!(h.telemetry.outcomes(events::REFRESH), vec![Outcome::Success]);
}

#[test]
fn test_empty_role_arn_fails_at_construction() {
    let clock = Arc::new(ManualClock::default());
    let tokens = StubTokenSource::new(Arc::clone(&clock));
    let sts = ScriptedExchange::new(Arc::clone(&clock), Vec::new());

    let err = CredentialProvider::builder(ProviderConfig::new(AUDIENCE, ""), sts.clone())
        .token_source(tokens.clone())
        .build()
        .unwrap_err();

    assert!(matches!(
        err,
        ProviderError::Configuration(ConfigError::EmptyRoleArn)
    ));
    assert_eq!(err.stage(), Stage::Configuration);
    assert_eq!(tokens.calls(), 0);
    assert_eq!(sts.attempts(), 0);
}

#[tokio::test]
async fn test_cached_credentials_are_reused() {
    let h = harness(Vec::new(), RefreshPolicy::default());

    let first = h.provider.current_credentials().await.unwrap();
    h.clock.advance(Duration::from_secs(30 * 60));
    let second = h.provider.current_credentials().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.sts.attempts(), 1);
    assert_eq!(h.tokens.calls(), 1);
    assert_eq!(h.provider.cache_state(), CacheState::Valid);
}

#[tokio::test]
async fn test_refresh_margin_triggers_exactly_one_refresh() {
    let h = harness(Vec::new(), RefreshPolicy::default());

    let first = h.provider.current_credentials().await.unwrap();
    // 90 seconds left: inside the default 2 minute margin.
    h.clock.advance(Duration::from_secs(58 * 60 + 30));

    let refreshed = h.provider.current_credentials().await.unwrap();
    let again = h.provider.current_credentials().await.unwrap();

    assert_ne!(first.access_key_id(), refreshed.access_key_id());
    assert!(Arc::ptr_eq(&refreshed, &again));
    assert_eq!(h.sts.attempts(), 2);
    assert_eq!(h.tokens.calls(), 2);
}

#[tokio::test]
async fn test_identity_failure_skips_exchange() {
    let clock = Arc::new(ManualClock::default());
    let tokens = StubTokenSource::failing(
        Arc::clone(&clock),
        TokenSourceError::Unavailable("connection refused".into()),
    );
    let sts = ScriptedExchange::new(Arc::clone(&clock), Vec::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    let provider = CredentialProvider::builder(ProviderConfig::new(AUDIENCE, ROLE_ARN), sts.clone())
        .token_source(tokens)
        .clock(clock)
        .telemetry(telemetry.clone())
        .build()
        .unwrap();

    let err = provider.current_credentials().await.unwrap_err();

    assert_eq!(err.stage(), Stage::Identity);
    assert_eq!(err.kind(), "identity_unavailable");
    assert_eq!(sts.attempts(), 0);
    assert_eq!(
        telemetry.outcomes(events::FETCH_IDENTITY_TOKEN),
        vec![Outcome::Failure("identity_unavailable")]
    );
}

#[tokio::test]
async fn test_stale_credentials_are_served_once_on_refresh_failure() {
    let h = harness(Vec::new(), RefreshPolicy::default());

    let first = h.provider.current_credentials().await.unwrap();
    h.clock.advance(Duration::from_secs(58 * 60 + 30));
    h.sts.push_error(ExchangeError::AccessDenied("trust policy changed".into()));
    h.sts.push_error(ExchangeError::AccessDenied("trust policy changed".into()));

    let stale = h.provider.current_credentials().await.unwrap();
    assert!(Arc::ptr_eq(&first, &stale));

    let err = h.provider.current_credentials().await.unwrap_err();
    assert_eq!(err.kind(), "access_denied");

    assert_eq!(
        h.telemetry.outcomes(events::CREDENTIALS),
        vec![
            Outcome::Success,
            Outcome::Stale("access_denied"),
            Outcome::Failure("access_denied"),
        ]
    );
}

#[tokio::test]
async fn test_stale_serving_can_be_disabled() {
    let h = harness(
        Vec::new(),
        RefreshPolicy {
            stale_tolerance: None,
            ..RefreshPolicy::default()
        },
    );

    h.provider.current_credentials().await.unwrap();
    h.clock.advance(Duration::from_secs(58 * 60 + 30));
    for _ in 0..4 {
        h.sts.push_error(ExchangeError::Unavailable("503".into()));
    }

    let err = h.provider.current_credentials().await.unwrap_err();
    assert_eq!(err.kind(), "unavailable");
    assert_eq!(h.provider.cache_state(), CacheState::Valid);
}

#[tokio::test]
async fn test_cancellation_leaves_cache_empty() {
    let clock = Arc::new(ManualClock::default());
    let sts = ScriptedExchange::new(Arc::clone(&clock), Vec::new());
    let cancel = CancellationToken::new();
    let provider = CredentialProvider::builder(ProviderConfig::new(AUDIENCE, ROLE_ARN), sts.clone())
        .token_source(Arc::new(HangingTokenSource))
        .clock(clock)
        .cancellation(cancel.clone())
        .build()
        .unwrap();

    let call = tokio::spawn({
        let provider = provider.clone();
        async move { provider.current_credentials().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ProviderError::Identity(TokenSourceError::Cancelled)
    ));
    assert_eq!(provider.cache_state(), CacheState::Empty);
    assert_eq!(sts.attempts(), 0);
}

#[tokio::test]
async fn test_expiration_is_the_granted_one_not_the_requested_one() {
    let clock = Arc::new(ManualClock::default());
    let tokens = StubTokenSource::new(Arc::clone(&clock));
    let sts = ScriptedExchange::new(Arc::clone(&clock), Vec::new());
    let config = ProviderConfig::new(AUDIENCE, ROLE_ARN)
        .with_session_duration(Duration::from_secs(2 * 60 * 60));
    let provider = CredentialProvider::builder(config, sts.clone())
        .token_source(tokens)
        .clock(clock.clone())
        .build()
        .unwrap();

    let creds = provider.current_credentials().await.unwrap();

    assert_eq!(
        sts.requested_durations(),
        vec![Some(Duration::from_secs(7200))]
    );
    assert_eq!(creds.expiration(), clock.now() + time::Duration::hours(1));
}

#[tokio::test]
async fn test_rendered_document_matches_current_credentials() {
    let h = harness(Vec::new(), RefreshPolicy::default());
    let creds = h.provider.current_credentials().await.unwrap();

    let doc = process_creds::render(&creds).unwrap();
    assert_eq!(
        std::str::from_utf8(&doc).unwrap(),
        r#"{"Version":1,"AccessKeyId":"AKIA0001","SecretAccessKey":"secret-1","SessionToken":"token-1","Expiration":"2030-01-01T01:00:00Z"}"#
    );
    assert_eq!(*process_creds::render(&creds).unwrap(), *doc);
    assert_eq!(creds.session_name(), AUDIENCE);
    assert_eq!(creds.role_arn(), ROLE_ARN);
}
