// src/sweep.rs

//! Periodic expiry of requests, cached results and placeholders

use std::sync::Weak;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::CoordinationConfig;
use crate::lifecycle::{FailureReason, LifecycleEvent};
use crate::reconcile::{advance, fail_pending};
use crate::state::{CorrelationState, Settlement};

#[derive(Debug, Default)]
pub struct SweepReport {
    pub settlements: Vec<Settlement>,
    pub orphaned_results: usize,
    pub expired_placeholders: usize,
}

impl SweepReport {
    pub fn summary(&self) -> SweepSummary {
        SweepSummary {
            timed_out: self.settlements.len(),
            orphaned_results: self.orphaned_results,
            expired_placeholders: self.expired_placeholders,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub timed_out: usize,
    pub orphaned_results: usize,
    pub expired_placeholders: usize,
}

impl SweepSummary {
    pub fn is_empty(&self) -> bool {
        self.timed_out == 0 && self.orphaned_results == 0 && self.expired_placeholders == 0
    }
}

pub fn sweep_expired(
    state: &mut CorrelationState,
    config: &CoordinationConfig,
    now: Instant,
) -> SweepReport {
    let mut report = SweepReport::default();
    let timeout = config.request_timeout();

    for correlation_id in state.registry.expired(now, timeout) {
        let message = format!(
            "No response within {}s",
            timeout.as_secs_f64()
        );
        if let Some(settlement) =
            fail_pending(state, &correlation_id, FailureReason::Timeout, message)
        {
            tracing::warn!(
                %correlation_id,
                kind = %settlement.resolution.kind,
                "Request timed out"
            );
            report.settlements.push(settlement);
        }
    }

    for orphan in state.results.evict_expired(now, config.result_ttl()) {
        advance(state, &orphan.correlation_id, LifecycleEvent::Expired);
        state.stats.orphaned_results += 1;
        report.orphaned_results += 1;
        tracing::warn!(
            correlation_id = %orphan.correlation_id,
            "Discarding response data whose entity never arrived"
        );
    }

    for placeholder in state.placeholders.expire(now, timeout) {
        state.stats.expired_placeholders += 1;
        report.expired_placeholders += 1;
        tracing::debug!(
            correlation_id = %placeholder.correlation_id,
            placeholder_id = %placeholder.id,
            "Removed orphaned placeholder"
        );
    }

    report
}

/// Something the sweeper can drive; implemented by the coordinator core
pub trait Sweepable: Send + Sync + 'static {
    fn sweep(&self, now: Instant) -> SweepSummary;
}

/// Runs `target.sweep` every `period` until `token` is cancelled or the
/// target is dropped
pub fn spawn_sweeper<T: Sweepable>(
    target: Weak<T>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(target) = target.upgrade() else {
                        break;
                    };
                    let summary = target.sweep(Instant::now());
                    if !summary.is_empty() {
                        tracing::debug!(?summary, "Sweep expired stale state");
                    }
                }
            }
        }

        tracing::debug!("Sweeper stopped");
    })
}
