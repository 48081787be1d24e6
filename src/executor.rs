/// executor.rs — Closure Executor (C7, spec §4.7)
///
/// Takes one `ClosureDecision` and submits it to the `BrokerGateway`.
/// Acquires the `pending_closure` lock for every member before sending
/// any order (idempotency: a decision already covered by a pending lock
/// is refused outright), closes members with a bounded per-member retry.
/// A member that succeeds (or is already gone on the broker — idempotent
/// close) has its lock released immediately. A member that fails keeps
/// its lock for exactly one more tick of re-attempt (spec §4.7 step 6);
/// if it fails again on that second attempt, the lock is released and an
/// operator-visible alert is logged.
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::broker::{BrokerGateway, ClosureEvent, ClosureObserver};
use crate::config::EngineConfig;
use crate::state::StateTracker;
use crate::types::{ClosureDecision, ClosureResult, EngineError, PositionId};

pub struct ClosureExecutor {
    broker: Arc<dyn BrokerGateway>,
    observer: Arc<dyn ClosureObserver>,
}

impl ClosureExecutor {
    pub fn new(broker: Arc<dyn BrokerGateway>, observer: Arc<dyn ClosureObserver>) -> Self {
        Self { broker, observer }
    }

    /// Execute one decision. Returns `Err(EngineError::InvariantViolation)`
    /// without touching the broker if any member is already locked
    /// (spec §4.7 idempotency guard) — the caller is expected to have
    /// already validated the decision through the evaluator, so this is
    /// a defense against a race against a concurrent tick, not a normal path.
    pub async fn execute(
        &self,
        decision: &ClosureDecision,
        state: &StateTracker,
        cfg: &EngineConfig,
        now: i64,
    ) -> Result<ClosureResult, EngineError> {
        let already_pending: Vec<PositionId> = decision
            .members
            .iter()
            .filter(|id| state.pending_closure.contains(id))
            .copied()
            .collect();
        if !already_pending.is_empty() {
            return Err(EngineError::InvariantViolation(format!(
                "members already pending closure: {already_pending:?}"
            )));
        }

        state.mark_pending(&decision.members);
        let started = Instant::now();

        let mut realized_total = 0.0;
        let mut retried_members = Vec::new();
        let mut failed_members = Vec::new();

        for &member in &decision.members {
            match self.close_with_retry(member, cfg).await {
                Ok((pnl, attempts)) => {
                    realized_total += pnl;
                    if attempts > 1 {
                        retried_members.push(member);
                    }
                    // succeeded: release the lock and any retry marker.
                    state.clear_pending(&[member]);
                    state.clear_retry_once(member);
                }
                Err(err) => {
                    if state.had_prior_failure(member) {
                        // Already given its one extra tick (spec §4.7 step 6):
                        // give up, release the lock, and alert the operator.
                        error!(
                            position = %member,
                            error = %err,
                            "member close failed again after one retry tick, releasing and alerting operator"
                        );
                        state.clear_pending(&[member]);
                        state.clear_retry_once(member);
                        failed_members.push(member);
                    } else {
                        // First failure: leave it locked in pending_closure
                        // for one more tick of re-attempt.
                        warn!(
                            position = %member,
                            error = %err,
                            "member close failed, leaving pending for one more tick"
                        );
                        state.mark_retry_once(member);
                        failed_members.push(member);
                    }
                }
            }
        }

        state.record_closure_time(now);

        let result = ClosureResult {
            members: decision.members.clone(),
            fully_succeeded: failed_members.is_empty(),
            realized_pnl: realized_total,
            predicted_net_pnl: decision.net_pnl,
            latency_ms: started.elapsed().as_millis() as u64,
            retried_members,
            failed_members,
        };

        let drift = (result.realized_pnl - result.predicted_net_pnl).abs();
        if drift > decision.net_pnl.abs().max(1.0) {
            warn!(
                predicted = decision.net_pnl,
                realized = result.realized_pnl,
                "large pnl drift between prediction and fill"
            );
        } else {
            info!(
                predicted = decision.net_pnl,
                realized = result.realized_pnl,
                members = ?result.members,
                "closure submitted"
            );
        }

        state.record_outcome(&result, now);
        self.observer.on_closure(&ClosureEvent {
            members: result.members.clone(),
            method_label: decision.method_label.clone(),
            predicted_net_pnl: result.predicted_net_pnl,
            realized_pnl: result.realized_pnl,
            fully_succeeded: result.fully_succeeded,
            timestamp: now,
        });

        Ok(result)
    }

    /// Reconcile members left pending from a prior tick's partial failure
    /// (spec §4.7 step 6). Each such member already had its one extra
    /// re-attempt tick granted when it first failed (`mark_retry_once`);
    /// this call is that second and final attempt — success releases the
    /// lock quietly, failure releases it with an operator-visible alert.
    /// Called by the orchestrator before the normal search phase, since
    /// these members are excluded from new candidates while still pending.
    pub async fn reconcile_pending_retries(
        &self,
        state: &StateTracker,
        cfg: &EngineConfig,
        now: i64,
    ) -> Vec<ClosureResult> {
        let mut results = Vec::new();
        for member in state.retry_once_ids() {
            let started = Instant::now();
            let outcome = self.close_with_retry(member, cfg).await;
            let result = match outcome {
                Ok((pnl, attempts)) => {
                    state.clear_pending(&[member]);
                    state.clear_retry_once(member);
                    ClosureResult {
                        members: vec![member],
                        fully_succeeded: true,
                        realized_pnl: pnl,
                        predicted_net_pnl: 0.0,
                        latency_ms: started.elapsed().as_millis() as u64,
                        retried_members: if attempts > 1 { vec![member] } else { vec![] },
                        failed_members: vec![],
                    }
                }
                Err(err) => {
                    error!(
                        position = %member,
                        error = %err,
                        "member close failed on its final re-attempt tick, releasing and alerting operator"
                    );
                    state.clear_pending(&[member]);
                    state.clear_retry_once(member);
                    ClosureResult {
                        members: vec![member],
                        fully_succeeded: false,
                        realized_pnl: 0.0,
                        predicted_net_pnl: 0.0,
                        latency_ms: started.elapsed().as_millis() as u64,
                        retried_members: vec![],
                        failed_members: vec![member],
                    }
                }
            };
            state.record_outcome(&result, now);
            self.observer.on_closure(&ClosureEvent {
                members: result.members.clone(),
                method_label: "pending_retry_reconciliation".into(),
                predicted_net_pnl: result.predicted_net_pnl,
                realized_pnl: result.realized_pnl,
                fully_succeeded: result.fully_succeeded,
                timestamp: now,
            });
            results.push(result);
        }
        results
    }

    /// Close one position, retrying transient broker errors up to
    /// `cfg.broker_retries` times with a short backoff, bounded by
    /// `cfg.broker_timeout_ms` per attempt.
    async fn close_with_retry(&self, id: PositionId, cfg: &EngineConfig) -> Result<(f64, u32), EngineError> {
        let mut last_err = None;
        for attempt in 1..=cfg.broker_retries.max(1) {
            let call = tokio::time::timeout(
                std::time::Duration::from_millis(cfg.broker_timeout_ms),
                self.broker.close_position(id),
            )
            .await;

            match call {
                Ok(Ok(pnl)) => return Ok((pnl, attempt)),
                Ok(Err(EngineError::StaleSnapshot(stale_id))) => {
                    // Idempotent close (spec §6/§7/§8 property 7): the
                    // position is already gone from the broker, so the
                    // close this tick wanted is already in effect. No
                    // additional pnl is realized by this call.
                    info!(position = %stale_id, "position already closed on broker, treating as success");
                    return Ok((0.0, attempt));
                }
                Ok(Err(err)) => {
                    warn!(position = %id, attempt, error = %err, "close attempt failed, retrying");
                    last_err = Some(err);
                }
                Err(_) => {
                    warn!(position = %id, attempt, "close attempt timed out, retrying");
                    last_err = Some(EngineError::TransientBroker("timeout".into()));
                }
            }
            if attempt < cfg.broker_retries {
                tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64)).await;
            }
        }
        Err(last_err.unwrap_or(EngineError::TransientBroker("exhausted retries".into())))
    }
}
