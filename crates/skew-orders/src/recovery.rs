//! Recovery coordination.
//!
//! After a recoverable failure the engine stops reconciling on triggers and
//! hands control to a single recovery task. The task waits a fixed delay,
//! refreshes state from the exchange and reconciles in recovery mode, and
//! repeats until a pass succeeds. Entry is single-flight: a second failure
//! while recovery is running is logged and dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skew_core::{MetricsSink, NoopSink};

use crate::error::{EngineError, EngineResult};
use crate::reconciler::{OrderReconciler, ReconcileMode, ReconcileOutcome};

pub struct RecoveryCoordinator {
    reconciler: Arc<OrderReconciler>,
    in_recovery: AtomicBool,
    retry_delay: Duration,
    attempts: AtomicU64,
    shutdown: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
}

impl RecoveryCoordinator {
    pub fn new(
        reconciler: Arc<OrderReconciler>,
        retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            in_recovery: AtomicBool::new(false),
            retry_delay,
            attempts: AtomicU64::new(0),
            shutdown,
            metrics: Arc::new(NoopSink),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_recovering(&self) -> bool {
        self.in_recovery.load(Ordering::SeqCst)
    }

    /// Total recovery attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Enter recovery because of `cause`.
    ///
    /// Returns the recovery task handle, or `None` if recovery was already
    /// running.
    pub fn enter(self: &Arc<Self>, cause: &EngineError) -> Option<JoinHandle<()>> {
        let symbol = self.reconciler.symbol();
        if self
            .in_recovery
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(symbol = %symbol, cause = %cause, "Recovery already in progress, ignoring");
            return None;
        }

        warn!(
            symbol = %symbol,
            cause = %cause,
            kind = cause.kind(),
            retry_delay_ms = self.retry_delay.as_millis() as u64,
            "Entering recovery"
        );
        self.metrics.recovery_state(symbol, true);

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            this.run_until_recovered().await;
        }))
    }

    /// Retry until a recovery pass succeeds or shutdown is requested.
    ///
    /// Returns whether recovery completed.
    async fn run_until_recovered(&self) -> bool {
        let symbol = self.reconciler.symbol();
        let recovered = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break false,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.attempt().await {
                Ok(outcome) => {
                    info!(
                        symbol = %symbol,
                        attempt,
                        outcome = outcome.label(),
                        "Recovery complete"
                    );
                    break true;
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        attempt,
                        error = %e,
                        kind = e.kind(),
                        "Recovery attempt failed, retrying"
                    );
                }
            }
        };

        self.in_recovery.store(false, Ordering::SeqCst);
        self.metrics.recovery_state(symbol, false);
        if !recovered {
            info!(symbol = %symbol, "Recovery abandoned on shutdown");
        }
        recovered
    }

    async fn attempt(&self) -> EngineResult<ReconcileOutcome> {
        self.reconciler.refresh_state().await?;
        self.reconciler.reconcile(ReconcileMode::Recovery).await
    }
}
