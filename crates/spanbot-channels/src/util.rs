//! Shared connector helpers: text chunking and send retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use spanbot_types::error::ChannelError;

/// Default retry attempts for transient send failures.
pub const SEND_RETRIES: u32 = 3;

/// Base backoff delay before the first retry.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Split text into chunks of at most `max_chars` characters.
///
/// Prefers breaking at a newline, then at a space, and falls back to a
/// hard cut. Boundaries are measured in characters so multi-byte text
/// never splits inside a code point.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];

        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&idx| idx > 0)
            .unwrap_or(window_end);

        chunks.push(rest[..cut].trim_end().to_owned());
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }

    if !rest.is_empty() {
        chunks.push(rest.to_owned());
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

/// Run `op` up to [`SEND_RETRIES`] times with exponential backoff
/// (base 1 s, factor 2, small jitter).
///
/// Only transient failures (connection / send / receive) are retried;
/// anything else is surfaced immediately.
pub async fn retry_send<T, F, Fut>(operation: &str, mut op: F) -> Result<T, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut last_error = None;

    for attempt in 1..=SEND_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                warn!(operation, attempt, error = %e, "transient send failure, retrying");
                last_error = Some(e);
                if attempt < SEND_RETRIES {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    tokio::time::sleep(delay + jitter).await;
                    delay *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| ChannelError::SendFailed(operation.to_owned())))
}

fn is_transient(error: &ChannelError) -> bool {
    matches!(
        error,
        ChannelError::ConnectionFailed(_)
            | ChannelError::SendFailed(_)
            | ChannelError::ReceiveFailed(_)
    )
}
