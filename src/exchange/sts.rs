use super::{ExchangeClient, ExchangeError, ExchangeRequest};
use crate::clock::BoxFuture;
use crate::credentials::CredentialSet;
use aws_sdk_sts::config::http::HttpResponse;
use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sts::operation::assume_role_with_web_identity::AssumeRoleWithWebIdentityError;
use aws_smithy_types::DateTime;
use time::OffsetDateTime;

/// [`ExchangeClient`] calling AWS STS `AssumeRoleWithWebIdentity`.
///
/// The STS client should be built with SDK retries disabled; retry is the
/// [`Exchanger`](super::Exchanger)'s job.
#[derive(Debug, Clone)]
pub struct StsExchangeClient {
    client: aws_sdk_sts::Client,
}

impl StsExchangeClient {
    /// Wraps an STS client.
    pub const fn new(client: aws_sdk_sts::Client) -> Self {
        Self { client }
    }

    /// Builds an STS client from a loaded SDK configuration.
    pub fn from_conf(config: &aws_config::SdkConfig) -> Self {
        Self::new(aws_sdk_sts::Client::new(config))
    }

    async fn assume(&self, request: &ExchangeRequest) -> Result<CredentialSet, ExchangeError> {
        let duration_seconds = request
            .duration
            .map(|d| i32::try_from(d.as_secs()).unwrap_or(i32::MAX));

        let output = self
            .client
            .assume_role_with_web_identity()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .web_identity_token(request.token.token())
            .set_duration_seconds(duration_seconds)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let creds = output.credentials().ok_or_else(|| ExchangeError::Rejected {
            code: "MissingCredentials".to_owned(),
            message: "STS response contained no credentials".to_owned(),
        })?;

        Ok(CredentialSet::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            creds.session_token(),
            to_offset_date_time(creds.expiration())?,
            request.role_arn.as_str(),
            request.session_name.as_str(),
        ))
    }
}

impl ExchangeClient for StsExchangeClient {
    fn assume_role_with_token<'a>(
        &'a self,
        request: &'a ExchangeRequest,
    ) -> BoxFuture<'a, Result<CredentialSet, ExchangeError>> {
        Box::pin(self.assume(request))
    }
}

fn classify_sdk_error(err: SdkError<AssumeRoleWithWebIdentityError, HttpResponse>) -> ExchangeError {
    match &err {
        SdkError::TimeoutError(_) => ExchangeError::Unavailable("STS request timed out".to_owned()),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ExchangeError::Unavailable(DisplayErrorContext(&err).to_string())
        }
        SdkError::ServiceError(ctx) => ExchangeError::from_remote(
            ctx.err().code(),
            ctx.err().message(),
            Some(ctx.raw().status().as_u16()),
        ),
        _ => ExchangeError::Rejected {
            code: err.code().unwrap_or("ConstructionFailure").to_owned(),
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

fn to_offset_date_time(dt: &DateTime) -> Result<OffsetDateTime, ExchangeError> {
    let nanos = i128::from(dt.secs()) * 1_000_000_000 + i128::from(dt.subsec_nanos());
    OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| ExchangeError::Rejected {
        code: "InvalidExpiration".to_owned(),
        message: format!("STS returned an out-of-range expiration: {dt:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_converts_sts_expiration() {
        let dt = DateTime::from_secs_and_nanos(1_893_456_000, 500);
        let got = to_offset_date_time(&dt).unwrap();
        assert_eq!(got, datetime!(2030-01-01 0:00:00.0000005 UTC));
    }
}
