use super::token::invalid_svid;
use super::{IdentityRequest, IdentityToken, TokenSource, TokenSourceError};
use crate::clock::{BoxFuture, Clock, SystemClock};
use crate::prelude::{debug, warn};
use spiffe::error::GrpcClientError;
use spiffe::workload_api::client::WorkloadApiClient;
use spiffe::JwtSvid;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::Code;

/// Default bound on each call to the identity agent.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`TokenSource`] backed by the SPIFFE Workload API.
///
/// The connection to the agent is opened lazily and reused across fetches.
/// If a fetch fails on a reused connection, the connection is recreated and
/// the fetch is tried once more before the error is returned.
pub struct WorkloadApiTokenSource {
    socket_path: Option<String>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    // Serializes connection creation; the agent is only ever asked for one token at a time.
    client: Mutex<Option<WorkloadApiClient>>,
}

impl WorkloadApiTokenSource {
    /// Creates a source for the agent at `socket_path`.
    ///
    /// When `socket_path` is `None`, `SPIFFE_ENDPOINT_SOCKET` is used.
    pub fn new(socket_path: Option<String>) -> Self {
        Self {
            socket_path: socket_path.filter(|p| !p.is_empty()),
            timeout: DEFAULT_AGENT_TIMEOUT,
            clock: Arc::new(SystemClock),
            client: Mutex::new(None),
        }
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the clock used to stamp tokens that carry no `iat` claim.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, GrpcClientError>>,
    ) -> Result<T, TokenSourceError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(TokenSourceError::Timeout(self.timeout)),
        }
    }

    async fn connect(&self) -> Result<WorkloadApiClient, TokenSourceError> {
        match self.socket_path.as_deref() {
            Some(path) => {
                debug!("Connecting to Workload API: socket={path}");
                self.bounded(WorkloadApiClient::new_from_path(path)).await
            }
            None => {
                debug!("Connecting to Workload API using SPIFFE_ENDPOINT_SOCKET");
                self.bounded(WorkloadApiClient::default()).await
            }
        }
    }

    async fn fetch_svid(
        &self,
        client: &mut WorkloadApiClient,
        request: &IdentityRequest,
    ) -> Result<JwtSvid, TokenSourceError> {
        let audience = [request.audience()];
        self.bounded(client.fetch_jwt_svid(&audience, request.spiffe_id()))
            .await
    }

    async fn fetch_inner(&self, request: &IdentityRequest) -> Result<IdentityToken, TokenSourceError> {
        let mut slot = self.client.lock().await;

        let reused = slot.is_some();
        let mut client = match slot.take() {
            Some(c) => c,
            None => self.connect().await?,
        };

        let svid = match self.fetch_svid(&mut client, request).await {
            Ok(svid) => svid,
            Err(e) if reused && e.is_unavailable() => {
                // The cached connection may have gone stale; retry once on a fresh one.
                warn!("JWT-SVID fetch failed on cached connection; reconnecting: error={e}");
                client = self.connect().await?;
                self.fetch_svid(&mut client, request).await?
            }
            Err(e) => return Err(e),
        };
        *slot = Some(client);
        drop(slot);

        IdentityToken::from_svid(&svid, request.audience(), self.clock.now())
    }
}

/// Splits agent failures into connection problems and issuance refusals.
fn classify(e: GrpcClientError) -> TokenSourceError {
    match e {
        GrpcClientError::Grpc(status) => {
            let detail = format!("{:?}: {}", status.code(), status.message());
            match status.code() {
                Code::Unavailable
                | Code::DeadlineExceeded
                | Code::Cancelled
                | Code::Unknown
                | Code::Aborted
                | Code::Internal
                | Code::ResourceExhausted => TokenSourceError::Unavailable(detail),
                _ => TokenSourceError::Denied(detail),
            }
        }
        GrpcClientError::EmptyResponse => {
            TokenSourceError::Denied("agent returned no JWT-SVID".to_owned())
        }
        GrpcClientError::InvalidJwtSvid(e) => invalid_svid(&e),
        other => TokenSourceError::Unavailable(error_chain(&other)),
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut cause = e.source();
    while let Some(c) = cause {
        out.push_str(": ");
        out.push_str(&c.to_string());
        cause = c.source();
    }
    out
}

impl Debug for WorkloadApiTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadApiTokenSource")
            .field("socket_path", &self.socket_path)
            .field("timeout", &self.timeout)
            .field("clock", &self.clock)
            .field("client", &"<Mutex<Option<WorkloadApiClient>>>")
            .finish()
    }
}

impl TokenSource for WorkloadApiTokenSource {
    fn fetch<'a>(
        &'a self,
        request: &'a IdentityRequest,
    ) -> BoxFuture<'a, Result<IdentityToken, TokenSourceError>> {
        Box::pin(self.fetch_inner(request))
    }
}
