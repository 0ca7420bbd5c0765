use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cn_core::payload::{Header, Payload, ServiceRef};
use cn_core::{
    CaptureRecord, JoinOutcome, JoinStatus, JoinTable, RuleStore, TokenId, TransitionType,
    now_millis,
};
use cn_lang::NodeKind;

use crate::capture_task::CaptureHandle;

// ---------------------------------------------------------------------------
// TokenEnvelope — one admitted token travelling through the node
// ---------------------------------------------------------------------------

/// An admitted token on its way to the service worker.
#[derive(Debug, Clone)]
pub struct TokenEnvelope {
    pub payload: Payload,
    /// Set for the single token a completed join emits; it re-enters the
    /// local worker and is routed like a pass node on egress.
    pub continuation: bool,
    /// Epoch millis at admission; lands in the outgoing monitor data.
    pub received_at: u64,
}

/// Events from the ingress reactor.
#[derive(Debug)]
pub(crate) enum SchedulerEvent {
    Admit(TokenEnvelope),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Two-level priority scheduler plus the fork/join coordination state.
///
/// Outer level: priority band per workflow version, ascending (lower version
/// wins, strictly — low bands may starve, by design). Inner level: FIFO,
/// except that a completed join's continuation is promoted to the head of
/// its band so the waiting siblings' work resumes first.
///
/// The worker is driven by a ready/dispatch handshake: a token is selected
/// only at the moment the worker reports idle, which is what makes the
/// priority test reproducible — nothing is buffered ahead of need.
pub struct Scheduler {
    event_rx: mpsc::Receiver<SchedulerEvent>,
    idle_rx: mpsc::Receiver<()>,
    dispatch_tx: mpsc::Sender<TokenEnvelope>,
    store: Arc<RwLock<RuleStore>>,
    joins: JoinTable,
    bands: BTreeMap<u32, VecDeque<TokenEnvelope>>,
    capture: CaptureHandle,
    cancel: CancellationToken,
    /// Root token of the whole node; cancelled on fatal coordination errors.
    fatal: CancellationToken,
    service: String,
    operation: String,
    sweep_interval: Duration,
    skew_millis: u64,
    high_watermark: usize,
    worker_idle: bool,
}

#[allow(clippy::too_many_arguments)]
impl Scheduler {
    pub(crate) fn new(
        event_rx: mpsc::Receiver<SchedulerEvent>,
        idle_rx: mpsc::Receiver<()>,
        dispatch_tx: mpsc::Sender<TokenEnvelope>,
        store: Arc<RwLock<RuleStore>>,
        capture: CaptureHandle,
        cancel: CancellationToken,
        fatal: CancellationToken,
        service: String,
        operation: String,
        sweep_interval: Duration,
        skew_millis: u64,
        high_watermark: usize,
    ) -> Self {
        Self {
            event_rx,
            idle_rx,
            dispatch_tx,
            store,
            joins: JoinTable::new(),
            bands: BTreeMap::new(),
            capture,
            cancel,
            fatal,
            service,
            operation,
            sweep_interval,
            skew_millis,
            high_watermark,
            worker_idle: false,
        }
    }

    /// Run the scheduler loop until cancelled.
    ///
    /// On cancellation the remaining queue is not force-drained — the worker
    /// takes no new tokens once the dispatch channel closes, and queued
    /// tokens are accounted for by the journal (their admission was
    /// captured; a stuck entry without exit is what offline analysis looks
    /// for after an unclean stop).
    #[tracing::instrument(name = "scheduler", skip_all)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event)?,
                        None => break, // reactor gone: clean shutdown
                    }
                }
                Some(()) = self.idle_rx.recv() => {
                    self.worker_idle = true;
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
                _ = self.cancel.cancelled() => break,
            }
            self.try_dispatch().await;
        }
        Ok(())
    }

    // -- event handling ------------------------------------------------------

    fn handle_event(&mut self, event: SchedulerEvent) -> anyhow::Result<()> {
        match event {
            SchedulerEvent::Admit(envelope) => self.admit(envelope),
        }
    }

    fn admit(&mut self, envelope: TokenEnvelope) -> anyhow::Result<()> {
        let version = envelope.payload.header.rule_base_version;
        let token = envelope.payload.header.sequence_id;

        let engine = {
            let store = self.store.read().expect("rule store lock poisoned");
            store.active(version).map(cn_core::RuleEngine::new)
        };
        let Some(engine) = engine else {
            // The reactor only forwards active versions; losing the base
            // between admission and here means it was retired mid-flight.
            cn_warn!(rule, token = %token, version = %version, "rule base vanished, dropping token");
            return Ok(());
        };

        let node_type = engine.node_type(&self.service, &self.operation);
        if node_type == Some(NodeKind::Join) && !envelope.continuation {
            return self.join_arrival(envelope);
        }

        self.enqueue(envelope, false);
        Ok(())
    }

    fn enqueue(&mut self, envelope: TokenEnvelope, promote: bool) {
        let band = envelope.payload.header.rule_base_version.number();
        let queue = self.bands.entry(band).or_default();
        if promote {
            queue.push_front(envelope);
        } else {
            queue.push_back(envelope);
        }

        let depth = self.depth();
        if depth > self.high_watermark {
            cn_warn!(pipe, depth = depth, watermark = self.high_watermark, "queue above high watermark");
        }
    }

    // -- join coordination ---------------------------------------------------

    fn join_arrival(&mut self, envelope: TokenEnvelope) -> anyhow::Result<()> {
        let token = envelope.payload.header.sequence_id;
        let transition = format!("{}.{}", self.service, self.operation);

        match self.joins.arrive(&transition, token, &envelope.payload.attributes) {
            Ok(JoinOutcome::Pending { observed, expected }) => {
                cn_debug!(pipe, token = %token, observed = observed, expected = expected, "join sibling consumed");
                // The join row is keyed by the workflow instance, i.e. the
                // decoded fork parent (arrive() validated the lineage).
                let instance = token.lineage().map(|l| l.parent).unwrap_or(token);
                self.capture_join(&transition, instance, observed, expected, JoinStatus::Waiting, None);
            }
            Ok(JoinOutcome::Complete { parent, expected, attributes }) => {
                cn_debug!(pipe, token = %token, parent = %parent, "join complete, emitting continuation");
                self.capture_join(
                    &transition,
                    parent,
                    expected,
                    expected,
                    JoinStatus::Complete,
                    Some(parent),
                );
                let continuation = TokenEnvelope {
                    payload: Payload {
                        header: Header {
                            sequence_id: parent,
                            rule_base_version: envelope.payload.header.rule_base_version,
                            created_at: envelope.payload.header.created_at,
                            updated_at: Some(now_millis()),
                        },
                        service: ServiceRef {
                            service: self.service.clone(),
                            operation: self.operation.clone(),
                        },
                        attributes,
                        monitor: envelope.payload.monitor.clone(),
                    },
                    continuation: true,
                    received_at: now_millis(),
                };
                self.enqueue(continuation, true);
            }
            Ok(JoinOutcome::Duplicate) => {
                cn_warn!(pipe, token = %token, "duplicate join sibling dropped");
            }
            Ok(JoinOutcome::AfterTerminal { status }) => {
                cn_warn!(pipe, token = %token, state = ?status, "sibling arrived after join settled, dropped");
            }
            Ok(JoinOutcome::Conflict { detail }) => {
                cn_warn!(pipe, token = %token, detail = %detail, "join attribute conflict, token to error sink");
                self.capture_error(token, "BindingConflict");
            }
            Err(e) => {
                // Fork/join invariants are the one fatal class: stop the node
                // rather than route on corrupted lineage.
                cn_error!(pipe, token = %token, error = %e, "coordination invariant violated");
                self.fatal.cancel();
                anyhow::bail!("coordination error: {e}");
            }
        }
        Ok(())
    }

    // -- dispatch ------------------------------------------------------------

    async fn try_dispatch(&mut self) {
        if !self.worker_idle {
            return;
        }
        let Some(envelope) = self.pop() else {
            return;
        };
        self.capture_entry(&envelope);
        if self.dispatch_tx.send(envelope).await.is_ok() {
            self.worker_idle = false;
        }
    }

    /// Pop the next runnable token: lowest version band first, FIFO within
    /// the band. Tokens whose deadline has passed are expired on the way
    /// out rather than dispatched.
    fn pop(&mut self) -> Option<TokenEnvelope> {
        let now = now_millis();
        loop {
            let band = *self.bands.keys().next()?;
            let queue = self.bands.get_mut(&band).expect("band just observed");
            let Some(envelope) = queue.pop_front() else {
                self.bands.remove(&band);
                continue;
            };
            if queue.is_empty() {
                self.bands.remove(&band);
            }
            if let Some(deadline) = envelope.payload.effective_deadline() {
                if now >= deadline {
                    self.capture_expired(&envelope, deadline);
                    continue;
                }
            }
            return Some(envelope);
        }
    }

    // -- sweeps --------------------------------------------------------------

    fn sweep(&mut self) {
        let now = now_millis();

        // Queued tokens past their deadline move to the expired sink.
        let mut expired = Vec::new();
        for queue in self.bands.values_mut() {
            queue.retain(|envelope| match envelope.payload.effective_deadline() {
                Some(deadline) if now >= deadline => {
                    expired.push((envelope.clone(), deadline));
                    false
                }
                _ => true,
            });
        }
        self.bands.retain(|_, queue| !queue.is_empty());
        for (envelope, deadline) in expired {
            self.capture_expired(&envelope, deadline);
        }

        // Joins whose deadline elapsed with missing siblings.
        for expired_join in self.joins.sweep(now, self.skew_millis) {
            cn_warn!(pipe,
                join = %expired_join.key.transition,
                parent = %expired_join.key.parent,
                observed = expired_join.observed,
                expected = expired_join.expected,
                "join deadline elapsed, no continuation"
            );
            self.capture.record(CaptureRecord::JoinSync {
                timestamp: now,
                join_transition_id: expired_join.key.transition,
                workflow_instance_id: expired_join.key.parent,
                expected: expired_join.expected,
                observed: expired_join.observed,
                status: JoinStatus::Expired,
                deadline: Some(expired_join.deadline),
                continuation_token_id: None,
            });
        }
    }

    fn depth(&self) -> usize {
        self.bands.values().map(VecDeque::len).sum()
    }

    // -- captures ------------------------------------------------------------

    fn capture_entry(&self, envelope: &TokenEnvelope) {
        let token = envelope.payload.header.sequence_id;
        let from_place = envelope.payload.monitor.last().map(|m| m.service.clone());
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: cn_core::transition_in(&self.operation),
            transition_type: TransitionType::Entry,
            token_id: token,
            workflow_base: token.version().base(),
            from_place,
            to_place: Some(self.operation.clone()),
            fork_decision: None,
            join_state: None,
            buffer_size: Some(self.depth()),
        });
    }

    fn capture_expired(&self, envelope: &TokenEnvelope, deadline: u64) {
        let token = envelope.payload.header.sequence_id;
        cn_debug!(pipe, token = %token, deadline = deadline, "token expired in queue");
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: "EXPIRED".to_string(),
            transition_type: TransitionType::Expired,
            token_id: token,
            workflow_base: token.version().base(),
            from_place: None,
            to_place: Some(self.operation.clone()),
            fork_decision: None,
            join_state: None,
            buffer_size: None,
        });
    }

    fn capture_error(&self, token: TokenId, what: &str) {
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: what.to_string(),
            transition_type: TransitionType::Error,
            token_id: token,
            workflow_base: token.version().base(),
            from_place: None,
            to_place: Some(self.operation.clone()),
            fork_decision: None,
            join_state: None,
            buffer_size: None,
        });
    }

    fn capture_join(
        &self,
        transition: &str,
        instance: TokenId,
        observed: u32,
        expected: u32,
        status: JoinStatus,
        continuation: Option<TokenId>,
    ) {
        self.capture.record(CaptureRecord::JoinSync {
            timestamp: now_millis(),
            join_transition_id: transition.to_string(),
            workflow_instance_id: instance,
            expected,
            observed,
            status,
            deadline: None,
            continuation_token_id: continuation,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cn_core::payload::JoinAttribute;

    fn test_scheduler() -> Scheduler {
        let (_event_tx, event_rx) = mpsc::channel(8);
        let (_idle_tx, idle_rx) = mpsc::channel(1);
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(1);
        let (capture_tx, _capture_rx) = mpsc::channel(64);
        Scheduler::new(
            event_rx,
            idle_rx,
            dispatch_tx,
            Arc::new(RwLock::new(RuleStore::new())),
            CaptureHandle::new(capture_tx),
            CancellationToken::new(),
            CancellationToken::new(),
            "triage".into(),
            "assess".into(),
            Duration::from_millis(100),
            0,
            1024,
        )
    }

    fn envelope(sequence_id: u64, version: u32, not_after: Option<u64>) -> TokenEnvelope {
        TokenEnvelope {
            payload: Payload {
                header: Header {
                    sequence_id: TokenId::new(sequence_id),
                    rule_base_version: cn_core::WorkflowVersion::new(version),
                    created_at: None,
                    updated_at: None,
                },
                service: ServiceRef {
                    service: "triage".into(),
                    operation: "assess".into(),
                },
                attributes: vec![JoinAttribute {
                    name: "vitals".into(),
                    value: "x".into(),
                    not_after,
                }],
                monitor: Vec::new(),
            },
            continuation: false,
            received_at: 0,
        }
    }

    #[tokio::test]
    async fn pop_prefers_lower_version_band() {
        let mut scheduler = test_scheduler();
        scheduler.enqueue(envelope(2_000_001, 2, None), false);
        scheduler.enqueue(envelope(1_000_001, 1, None), false);
        scheduler.enqueue(envelope(2_000_002, 2, None), false);

        let order: Vec<u64> = std::iter::from_fn(|| scheduler.pop())
            .map(|e| e.payload.header.sequence_id.raw())
            .collect();
        assert_eq!(order, vec![1_000_001, 2_000_001, 2_000_002]);
    }

    #[tokio::test]
    async fn promotion_jumps_the_band_queue() {
        let mut scheduler = test_scheduler();
        scheduler.enqueue(envelope(1_000_001, 1, None), false);
        scheduler.enqueue(envelope(1_000_002, 1, None), false);
        // A completed join's continuation goes to the head of its band.
        scheduler.enqueue(envelope(1_000_000, 1, None), true);

        let first = scheduler.pop().unwrap();
        assert_eq!(first.payload.header.sequence_id.raw(), 1_000_000);
    }

    #[tokio::test]
    async fn pop_expires_stale_tokens() {
        let mut scheduler = test_scheduler();
        let past = now_millis().saturating_sub(1);
        scheduler.enqueue(envelope(1_000_001, 1, Some(past)), false);
        scheduler.enqueue(envelope(1_000_002, 1, None), false);

        let next = scheduler.pop().unwrap();
        assert_eq!(next.payload.header.sequence_id.raw(), 1_000_002);
        assert!(scheduler.pop().is_none());
    }

    #[tokio::test]
    async fn sweep_expires_queued_tokens() {
        let mut scheduler = test_scheduler();
        let past = now_millis().saturating_sub(1);
        scheduler.enqueue(envelope(1_000_001, 1, Some(past)), false);
        scheduler.enqueue(envelope(1_000_002, 1, None), false);

        scheduler.sweep();
        assert_eq!(scheduler.depth(), 1);
    }
}
