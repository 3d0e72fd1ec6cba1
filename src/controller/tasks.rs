//! Per-reconcile set of concurrent, individually time-bounded sub-operations

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::Result;

/// Sub-operations spawned by one reconcile call.
///
/// Each task runs under its own timeout. [`SubTasks::join_bounded`] waits at
/// most that long for the set as a whole; stragglers are detached and finish
/// (or time out) on their own, so the reconcile's re-queue never depends on them.
pub struct SubTasks {
    set: JoinSet<()>,
    timeout: Duration,
}

impl SubTasks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            set: JoinSet::new(),
            timeout,
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let timeout = self.timeout;
        self.set.spawn(async move {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => debug!(task = name, "Sub-operation finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Sub-operation failed"),
                Err(_) => warn!(
                    task = name,
                    timeout_secs = timeout.as_secs(),
                    "Sub-operation timed out"
                ),
            }
        });
    }

    /// Wait up to the timeout for every task, then detach whatever is still running.
    /// Returns the number of detached tasks.
    pub async fn join_bounded(mut self) -> usize {
        let set = &mut self.set;
        let _ = tokio::time::timeout(self.timeout, async {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "Sub-operation panicked");
                    }
                }
            }
        })
        .await;

        let detached = self.set.len();
        if detached > 0 {
            debug!(detached, "Detaching unfinished sub-operations");
        }
        self.set.detach_all();
        detached
    }
}
