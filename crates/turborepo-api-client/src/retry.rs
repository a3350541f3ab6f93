use std::time::Duration;

use reqwest::{RequestBuilder, Response};

use crate::Error;

const MAX_RETRIES: u32 = 2;
const BASE_DELAY_MS: u64 = 200;

/// Sends a request, retrying connection failures and 5xx responses with a
/// small exponential backoff. 4xx responses are returned to the caller
/// untouched since they carry protocol meaning (404 miss, 403 policy).
pub(crate) async fn make_retryable_request(request_builder: RequestBuilder) -> Result<Response, Error> {
    let mut last_error = None;
    for attempt in 0..=MAX_RETRIES {
        let Some(builder) = request_builder.try_clone() else {
            // streaming bodies can't be cloned; send once
            return Ok(request_builder.send().await?);
        };
        match builder.send().await {
            Ok(response) if response.status().is_server_error() && attempt < MAX_RETRIES => {
                tracing::debug!("retrying request after status {}", response.status());
            }
            Ok(response) => return Ok(response),
            Err(err) if attempt < MAX_RETRIES && err.is_connect() => {
                tracing::debug!("retrying request after connect error");
                last_error = Some(err);
            }
            Err(err) => return Err(err.into()),
        }
        tokio::time::sleep(Duration::from_millis(BASE_DELAY_MS << attempt)).await;
    }
    Err(last_error.expect("loop exits early unless an error occurred").into())
}
