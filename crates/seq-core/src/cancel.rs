//! Cooperative cancellation.
//!
//! Long operations (moves, scans, fluidic steps, sequences) take a
//! [`CancellationToken`] and check it at their suspension points. A
//! cancelled operation stops issuing new commands, leaves in-flight channel
//! transactions to the channel (a dropped transaction marks the link dirty,
//! the next one drains it) and reports [`SeqError::Cancelled`].

use crate::error::{SeqError, SeqResult};
use std::future::Future;

pub use tokio_util::sync::CancellationToken;

/// Run `fut` unless `token` is cancelled first.
///
/// Cancellation wins ties so nothing new starts after a cancel request.
pub async fn run_cancellable<T, F>(
    token: &CancellationToken,
    operation: &'static str,
    fut: F,
) -> SeqResult<T>
where
    F: Future<Output = SeqResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SeqError::Cancelled { operation }),
        result = fut => result,
    }
}

/// Fail fast if `token` is already cancelled.
pub fn check_cancelled(token: &CancellationToken, operation: &'static str) -> SeqResult<()> {
    if token.is_cancelled() {
        Err(SeqError::Cancelled { operation })
    } else {
        Ok(())
    }
}

/// Sleep for `duration`, or return `Cancelled` as soon as the token fires.
pub async fn sleep_cancellable(
    token: &CancellationToken,
    operation: &'static str,
    duration: std::time::Duration,
) -> SeqResult<()> {
    run_cancellable(token, operation, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_work() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let err = sleep_cancellable(&token, "hold", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err, SeqError::Cancelled { operation: "hold" });
    }

    #[tokio::test]
    async fn cancelled_token_wins_over_ready_future() {
        let token = CancellationToken::new();
        token.cancel();
        let result = run_cancellable(&token, "noop", async { Ok(1) }).await;
        assert!(result.is_err());
        assert!(check_cancelled(&token, "noop").is_err());
    }

    #[tokio::test]
    async fn uncancelled_future_completes() {
        let token = CancellationToken::new();
        let value = run_cancellable(&token, "noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
