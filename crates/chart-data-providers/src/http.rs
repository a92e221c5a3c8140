use std::error::Error as _;
use std::io;

use chart_data_core::coverage::ProviderId;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{SourceError, UnavailableCause};

/// Connection-level failures worth one more attempt. Timeouts are not: the
/// provider already had its full budget.
pub(crate) fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return false;
    }
    if err.is_connect() {
        return true;
    }
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return is_transient_io(io_err.kind());
        }
        source = inner.source();
    }
    false
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn send_with_retry(
    provider: ProviderId,
    request: RequestBuilder,
) -> Result<Response, SourceError> {
    let retry = request.try_clone();
    match request.send().await {
        Ok(response) => Ok(response),
        Err(e) if is_transient(&e) => match retry {
            Some(retry) => {
                warn!("{provider}: transient transport error, retrying once: {e}");
                retry
                    .send()
                    .await
                    .map_err(|e| SourceError::unavailable(provider, e))
            }
            None => Err(SourceError::unavailable(provider, e)),
        },
        Err(e) => Err(SourceError::unavailable(provider, e)),
    }
}

/// Send a GET, check the status, and decode the JSON body.
pub(crate) async fn get_json<T: DeserializeOwned>(
    provider: ProviderId,
    request: RequestBuilder,
) -> Result<T, SourceError> {
    let response = send_with_retry(provider, request).await?;

    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        return Err(SourceError::unavailable(
            provider,
            UnavailableCause::RateLimited { retry_after_secs },
        ));
    }

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        return Err(SourceError::unavailable(
            provider,
            UnavailableCause::Api { status, message },
        ));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| SourceError::unavailable(provider, e))?;
    serde_json::from_slice(&body).map_err(|e| {
        SourceError::unavailable(
            provider,
            UnavailableCause::Decode(format!("failed to parse response: {e}")),
        )
    })
}
