//! Cancellable scheduled tasks
//!
//! Polling and reconnect backoff run as spawned tasks owned by a
//! [`ScheduledTask`] handle. Cancelling the handle (or dropping it) stops the
//! task at its next suspension point, dropping whatever future it was
//! awaiting.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a spawned one-shot or repeating task
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `task` once after `delay`
    pub fn after<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = async {
                    tokio::time::sleep(delay).await;
                    task.await;
                } => {}
            }
        });

        Self { token, handle }
    }

    /// Run `cycle` immediately, then again `interval` after each completion.
    ///
    /// The interval is measured from the end of a cycle, so a slow cycle
    /// pushes the next one back instead of piling up.
    pub fn repeating<F, Fut>(interval: Duration, mut cycle: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = cycle() => {}
                }
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Self { token, handle }
    }

    /// Cancel the task. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the task has been cancelled or has run to completion
    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled() || self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
