//! Optimistic-concurrency read-modify-write with bounded retry
//!
//! Every conditional write the operator performs goes through
//! [`read_modify_write`]: fetch the current object, compute and apply a
//! mutation, and when the store reports a transient condition (version
//! conflict, expired resource version, leadership change) start over from a
//! fresh read. Running out of attempts is a normal outcome, not an error: the
//! next scheduled reconcile picks the work up again.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::metrics;
use crate::config::OperatorConfig;
use crate::error::{Error, Result};

/// A fetch → transact → commit unit of work against the store
#[async_trait]
pub trait Transaction: Send + Sync {
    /// What `fetch` reads
    type Fetched: Clone + Send + Sync;
    /// What `transact` produces on success
    type Output: Send + Sync;

    /// Short identifier used in logs and metrics
    fn name(&self) -> &'static str;

    /// Whether `transact` should run when `fetch` finds nothing.
    /// When false, an absent object counts as "not ready yet" and the attempt is retried.
    fn admit_missing(&self) -> bool {
        false
    }

    async fn fetch(&self) -> Result<Option<Self::Fetched>>;

    async fn transact(&self, fetched: Option<Self::Fetched>) -> Result<Self::Output>;

    /// Runs after a successful `transact`. A transient failure here rolls the attempt back.
    async fn on_commit(&self, _output: &Self::Output) -> Result<()> {
        Ok(())
    }

    /// Runs before every retry: after a transient failure or a fetch that found nothing
    async fn on_rollback(&self, _fetched: Option<&Self::Fetched>) {}
}

/// Result of [`read_modify_write`]
#[derive(Debug)]
pub enum TxOutcome<F, O> {
    Committed {
        fetched: Option<F>,
        output: O,
        attempts: u32,
    },
    /// Every attempt failed transiently; no progress this cycle
    Exhausted { attempts: u32 },
    /// The cancellation token fired; any in-flight result was discarded
    Cancelled,
}

impl<F, O> TxOutcome<F, O> {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxOutcome::Committed { .. })
    }

    pub fn output(self) -> Option<O> {
        match self {
            TxOutcome::Committed { output, .. } => Some(output),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TxOutcome::Committed { .. } => "committed",
            TxOutcome::Exhausted { .. } => "exhausted",
            TxOutcome::Cancelled => "cancelled",
        }
    }
}

/// Attempt budget and backoff between attempts
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts (None = until cancelled)
    pub max_attempts: Option<u32>,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(30),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            ..Default::default()
        }
    }

    /// Retry back to back without sleeping
    pub fn immediate(max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Add jitter: 0.5x to 1.5x of the delay
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

enum Attempt<F, O> {
    Committed(Option<F>, O),
    NotReady,
    Transient(Error),
}

async fn attempt<T: Transaction>(tx: &T) -> Result<Attempt<T::Fetched, T::Output>> {
    let fetched = match tx.fetch().await {
        Ok(fetched) => fetched,
        Err(e) if e.is_transient() => {
            tx.on_rollback(None).await;
            return Ok(Attempt::Transient(e));
        }
        Err(e) => return Err(e),
    };

    if fetched.is_none() && !tx.admit_missing() {
        tx.on_rollback(None).await;
        return Ok(Attempt::NotReady);
    }

    let applied = match tx.transact(fetched.clone()).await {
        Ok(output) => tx.on_commit(&output).await.map(|_| output),
        Err(e) => Err(e),
    };

    match applied {
        Ok(output) => Ok(Attempt::Committed(fetched, output)),
        Err(e) if e.is_transient() => {
            tx.on_rollback(fetched.as_ref()).await;
            Ok(Attempt::Transient(e))
        }
        Err(e) => Err(e),
    }
}

/// Run `tx` until it commits, the attempt budget runs out or `cancel` fires.
///
/// Only non-transient failures are returned as `Err`.
pub async fn read_modify_write<T: Transaction>(
    tx: &T,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<TxOutcome<T::Fetched, T::Output>> {
    let outcome = run(tx, policy, cancel).await;
    if let Ok(outcome) = &outcome {
        metrics::record_transaction(tx.name(), outcome.label());
    }
    outcome
}

async fn run<T: Transaction>(
    tx: &T,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<TxOutcome<T::Fetched, T::Output>> {
    let mut attempts = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TxOutcome::Cancelled),
            result = attempt(tx) => result?,
        };

        match result {
            Attempt::Committed(fetched, output) => {
                debug!(transaction = tx.name(), attempts, "Transaction committed");
                return Ok(TxOutcome::Committed {
                    fetched,
                    output,
                    attempts,
                });
            }
            Attempt::NotReady => {
                debug!(transaction = tx.name(), attempt = attempts, "Object not found, retrying");
            }
            Attempt::Transient(e) => {
                debug!(
                    transaction = tx.name(),
                    attempt = attempts,
                    error = %e,
                    "Transient failure, rolled back"
                );
            }
        }

        if policy.exhausted(attempts) {
            warn!(
                transaction = tx.name(),
                attempts,
                "Transaction made no progress after max attempts"
            );
            return Ok(TxOutcome::Exhausted { attempts });
        }

        let pause = jittered(delay);
        if !pause.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TxOutcome::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
        delay = policy.next_delay(delay);
    }
}
