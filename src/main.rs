use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use aws_config::retry::RetryConfig as SdkRetryConfig;
use aws_config::{BehaviorVersion, Region};
use clap::{Args, Parser, Subcommand};
use spiffe_aws_assume_role::duration::parse_iso8601;
use spiffe_aws_assume_role::telemetry::events;
use spiffe_aws_assume_role::{
    process_creds, CredentialProvider, LogTelemetry, Outcome, ProviderConfig, StsExchangeClient,
    Telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, subscriber, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_STS_REGION: &str = "us-east-1";
const SERVICE_NAME: &str = "spiffe-aws-assume-role";

/// Exchange a SPIFFE JWT-SVID for temporary AWS credentials.
#[derive(Debug, Parser)]
#[command(name = "spiffe-aws-assume-role", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print AWS credentials in `credential_process` format.
    Credentials(CredentialsArgs),
}

#[derive(Debug, Args)]
struct CredentialsArgs {
    /// JWT-SVID audience. Must match the audience trusted by the IAM identity provider.
    #[arg(long)]
    audience: String,

    /// AWS role ARN to assume.
    #[arg(long = "role-arn")]
    role_arn: String,

    /// SPIFFE ID of this workload. Defaults to the agent's default identity.
    #[arg(long = "spiffe-id")]
    spiffe_id: Option<String>,

    /// Path to the SPIFFE Workload API socket.
    #[arg(long = "workload-socket", env = "SPIFFE_ENDPOINT_SOCKET")]
    workload_socket: Option<String>,

    /// AWS role session name. Derived from the audience when omitted.
    #[arg(long = "session-name")]
    session_name: Option<String>,

    /// Session duration as an ISO-8601 duration (e.g. PT15M).
    #[arg(long = "session-duration", value_parser = parse_iso8601)]
    session_duration: Option<Duration>,

    /// AWS STS endpoint URL.
    #[arg(long = "sts-endpoint")]
    sts_endpoint: Option<String>,

    /// AWS STS region.
    #[arg(long = "sts-region")]
    sts_region: Option<String>,

    /// Service name attached to telemetry events.
    #[arg(long = "telemetry-name", default_value = SERVICE_NAME)]
    telemetry_name: String,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Credentials(args) = cli.command;

    if let Err(e) = init_logging(args.debug) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancel.clone()));

    let telemetry = Arc::new(LogTelemetry::with_service(args.telemetry_name.as_str()));
    if let Some(region) = &args.sts_region {
        telemetry.add_label("stsRegion", region);
    }

    match credentials(args, Arc::clone(&telemetry) as Arc<dyn Telemetry>, cancel).await {
        Ok(document) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(&document).and_then(|()| stdout.flush()) {
                error!("Failed to write credentials to stdout: {e}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn credentials(
    args: CredentialsArgs,
    telemetry: Arc<dyn Telemetry>,
    cancel: CancellationToken,
) -> anyhow::Result<zeroize::Zeroizing<Vec<u8>>> {
    let start = Instant::now();

    let mut config = ProviderConfig::new(args.audience.as_str(), args.role_arn.as_str());
    if let Some(name) = &args.session_name {
        config = config.with_session_name(name.as_str());
    }
    if let Some(duration) = args.session_duration {
        config = config.with_session_duration(duration);
    }
    if let Some(id) = &args.spiffe_id {
        config = config.with_spiffe_id(id.as_str());
    }

    let sdk_config = load_sts_config(args.sts_endpoint.as_deref(), args.sts_region.as_deref()).await;

    let mut builder =
        CredentialProvider::builder(config, Arc::new(StsExchangeClient::from_conf(&sdk_config)))
            .telemetry(Arc::clone(&telemetry))
            .cancellation(cancel);
    if let Some(socket) = args.workload_socket {
        builder = builder.workload_socket(socket);
    }

    let provider = match builder.build() {
        Ok(provider) => provider,
        Err(e) => {
            // The provider records its own `credentials` event once built.
            telemetry.record_event(events::CREDENTIALS, Outcome::Failure(e.kind()), start.elapsed());
            return Err(e).context("failed to instantiate credentials provider");
        }
    };
    debug!(
        "Requesting credentials: audience={}, role_arn={}, session_name={}",
        provider.audience(),
        provider.role_arn(),
        provider.session_name()
    );

    let creds = provider
        .current_credentials()
        .await
        .context("failed to obtain credentials")?;

    process_creds::render(&creds).context("failed to serialize credentials")
}

async fn load_sts_config(endpoint: Option<&str>, region: Option<&str>) -> aws_config::SdkConfig {
    // Exchange retries are handled by the provider; the SDK must not retry on its own.
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .retry_config(SdkRetryConfig::disabled())
        .no_credentials();
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_owned()));
    }
    if let Some(endpoint) = endpoint {
        loader = loader.endpoint_url(endpoint);
    }

    let loaded = loader.load().await;
    if loaded.region().is_some() {
        return loaded;
    }

    debug!("No region configured, using {DEFAULT_STS_REGION} for STS");
    loaded
        .into_builder()
        .region(Region::new(DEFAULT_STS_REGION))
        .build()
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        debug!("Interrupted; cancelling credential refresh");
        cancel.cancel();
    }
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };

    // RUST_LOG overrides --debug.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    // stdout carries the credential document; logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .compact()
        .finish();

    subscriber::set_global_default(subscriber)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_credentials_flags() {
        let cli = Cli::try_parse_from([
            "spiffe-aws-assume-role",
            "credentials",
            "--audience",
            "sts.amazonaws.com",
            "--role-arn",
            "arn:aws:iam::123456789012:role/demo",
            "--session-duration",
            "PT15M",
            "--sts-region",
            "us-west-2",
            "--debug",
        ])
        .unwrap();
        let Command::Credentials(args) = cli.command;
        assert_eq!(args.audience, "sts.amazonaws.com");
        assert_eq!(args.session_duration, Some(Duration::from_secs(900)));
        assert_eq!(args.sts_region.as_deref(), Some("us-west-2"));
        assert_eq!(args.telemetry_name, SERVICE_NAME);
        assert!(args.debug);
    }

    #[test]
    fn test_rejects_month_durations() {
        let err = Cli::try_parse_from([
            "spiffe-aws-assume-role",
            "credentials",
            "--audience",
            "a",
            "--role-arn",
            "r",
            "--session-duration",
            "P1M",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
