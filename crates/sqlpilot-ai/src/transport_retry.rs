use std::future::Future;

#[cfg(not(test))]
use std::time::Duration;

use tracing::warn;

use crate::error::AiError;

pub const DEFAULT_TRANSPORT_RETRY_COUNT: usize = 3;

/// Repeats `operation` while it fails with a transport error, at most `retries` extra times.
pub(crate) async fn retry_transport_operation<T, F, Fut>(
    retries: usize,
    mut operation: F,
) -> Result<T, AiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AiError>>,
{
    let mut remaining_retries = retries;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if error.is_transport() && remaining_retries > 0 => {
                remaining_retries -= 1;
                warn!(
                    remaining_retries,
                    error = error.message.as_str(),
                    "retrying model request after transport failure"
                );
                sleep_retry_interval().await;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn sleep_retry_interval() {
    #[cfg(not(test))]
    {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
