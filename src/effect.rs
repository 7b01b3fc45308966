//! Switch-latest retrying effect.
//!
//! A [`RetryingEffect`] runs an async operation with bounded retries and the
//! guarantee that only the most recent invocation may publish state: every
//! resolution point checks a generation counter, and a stale run's result is
//! discarded wholesale. Callers observe progress through the shared
//! [`EffectState`] snapshot instead of awaiting the run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::transport::BoxFuture;

/// Exponential backoff schedule for retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Attempts before giving up (the first try counts as attempt 1)
    pub max_retries: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Multiplier applied per additional attempt
    pub factor: f64,

    /// Ceiling on any single delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay to sleep after a failed `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Observable snapshot of a run.
#[derive(Debug, Clone, Default)]
pub struct EffectState<T> {
    /// A run is active and has not resolved yet
    pub in_progress: bool,

    /// Last successful result, if any
    pub result: Option<T>,

    /// Last terminal error, if any; cleared when a new run starts
    pub error: Option<String>,
}

/// An async operation with retry and switch-latest invocation semantics.
///
/// `trigger` starts a run for a parameter value, cancelling (by
/// invalidation, not abort) any run already in flight. State transitions are
/// only ever published by the run whose generation is still current.
pub struct RetryingEffect<P, T> {
    op: Arc<dyn Fn(P) -> BoxFuture<'static, Result<T>> + Send + Sync>,
    policy: BackoffPolicy,
    generation: Arc<AtomicU64>,
    state: Arc<RwLock<EffectState<T>>>,
}

impl<P, T> RetryingEffect<P, T>
where
    P: Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create an effect around `op`.
    pub fn new<F>(op: F, policy: BackoffPolicy) -> Self
    where
        F: Fn(P) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    {
        Self {
            op: Arc::new(op),
            policy,
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(RwLock::new(EffectState {
                in_progress: false,
                result: None,
                error: None,
            })),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> EffectState<T> {
        self.state.read().unwrap().clone()
    }

    /// Start a run for `param`, superseding any run in flight.
    pub fn trigger(&self, param: P) {
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            // A fresh run owns the state from the start.
            let mut state = self.state.write().unwrap();
            state.in_progress = true;
            state.result = None;
            state.error = None;
        }

        let op = Arc::clone(&self.op);
        let policy = self.policy.clone();
        let generation = Arc::clone(&self.generation);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let outcome = Self::run_with_retry(op, policy, &generation, my_gen, param).await;

            // A newer trigger owns the state now; drop this run's outcome.
            if generation.load(Ordering::SeqCst) != my_gen {
                return;
            }
            let mut state = state.write().unwrap();
            state.in_progress = false;
            match outcome {
                Ok(value) => state.result = Some(value),
                Err(e) => state.error = Some(e.to_string()),
            }
        });
    }

    /// Invalidate any run in flight without starting a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().unwrap();
        state.in_progress = false;
    }

    async fn run_with_retry(
        op: Arc<dyn Fn(P) -> BoxFuture<'static, Result<T>> + Send + Sync>,
        policy: BackoffPolicy,
        generation: &AtomicU64,
        my_gen: u64,
        param: P,
    ) -> Result<T> {
        let mut last_error = String::new();
        for attempt in 1..=policy.max_retries {
            match op(param.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!("[Effect] attempt {}/{} failed: {}", attempt, policy.max_retries, e);
                }
            }
            // Superseded runs stop retrying immediately.
            if generation.load(Ordering::SeqCst) != my_gen {
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt,
                    message: "superseded".to_string(),
                });
            }
            if attempt < policy.max_retries {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
        Err(SyncError::RetriesExhausted {
            attempts: policy.max_retries,
            message: last_error,
        })
    }
}
