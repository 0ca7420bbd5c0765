use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cn_core::{CaptureRecord, RuleEngine, RuleStore, TokenId, TransitionType, now_millis};

use crate::capture_task::CaptureHandle;
use crate::publisher::{PublishFailure, Publisher};
use crate::scheduler::TokenEnvelope;
use crate::service::{ServiceFailure, ServiceHandler};

// ---------------------------------------------------------------------------
// ServiceWorker
// ---------------------------------------------------------------------------

/// The single worker in front of the local business service.
///
/// Strictly one invocation at a time: the worker announces idleness to the
/// scheduler, receives exactly one token, runs the restrict → invoke →
/// publish pipeline, and only then asks for the next. The local service is
/// never required to be reentrant.
pub(crate) struct ServiceWorker {
    dispatch_rx: mpsc::Receiver<TokenEnvelope>,
    idle_tx: mpsc::Sender<()>,
    handler: Arc<dyn ServiceHandler>,
    publisher: Publisher,
    store: Arc<RwLock<RuleStore>>,
    service: String,
    operation: String,
    retry_cap: u32,
    retry_base_delay: Duration,
    capture: CaptureHandle,
    cancel: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl ServiceWorker {
    pub(crate) fn new(
        dispatch_rx: mpsc::Receiver<TokenEnvelope>,
        idle_tx: mpsc::Sender<()>,
        handler: Arc<dyn ServiceHandler>,
        publisher: Publisher,
        store: Arc<RwLock<RuleStore>>,
        service: String,
        operation: String,
        retry_cap: u32,
        retry_base_delay: Duration,
        capture: CaptureHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dispatch_rx,
            idle_tx,
            handler,
            publisher,
            store,
            service,
            operation,
            retry_cap,
            retry_base_delay,
            capture,
            cancel,
        }
    }

    /// Run until the scheduler closes the dispatch channel. An in-flight
    /// invocation always completes; cancellation is cooperative.
    #[tracing::instrument(name = "worker", skip_all)]
    pub(crate) async fn run(mut self) -> anyhow::Result<()> {
        loop {
            if self.idle_tx.send(()).await.is_err() {
                break; // scheduler gone
            }
            let Some(envelope) = self.dispatch_rx.recv().await else {
                break;
            };
            self.process(envelope).await?;
        }
        Ok(())
    }

    // -- one token -----------------------------------------------------------

    async fn process(&mut self, envelope: TokenEnvelope) -> anyhow::Result<()> {
        let token = envelope.payload.header.sequence_id;
        let version = envelope.payload.header.rule_base_version;

        let engine = {
            let store = self.store.read().expect("rule store lock poisoned");
            store.active(version).map(RuleEngine::new)
        };
        let Some(engine) = engine else {
            cn_warn!(rule, token = %token, version = %version, "rule base vanished before invocation");
            return Ok(());
        };

        let attributes: BTreeMap<String, String> = envelope
            .payload
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect();

        // Node-type guard dispatch (Gateway/Decision/Merge) happens in one
        // place, the publisher; the worker only enforces the binding
        // contract around the invocation.

        // Restrict the input to the declared required attributes.
        let required = engine.required_attributes(&self.operation);
        let input: BTreeMap<String, String> = if required.is_empty() {
            attributes.clone()
        } else {
            let mut input = BTreeMap::new();
            for name in &required {
                match attributes.get(name) {
                    Some(value) => {
                        input.insert(name.clone(), value.clone());
                    }
                    None => {
                        cn_warn!(pipe, token = %token, attribute = %name, "required attribute missing");
                        self.capture_error(token, "BindingViolation");
                        return Ok(());
                    }
                }
            }
            input
        };

        let output = match self.invoke_with_retry(&input).await {
            Ok(output) => output,
            Err(failure) => {
                cn_warn!(pipe, token = %token, error = %failure, "service invocation failed");
                self.capture_error(token, "ServiceFailure");
                return Ok(());
            }
        };

        // The deadline may have passed while the service was running; the
        // invocation is never interrupted, but a late result is discarded.
        let deadline = envelope.payload.effective_deadline();
        if let Some(deadline) = deadline {
            if now_millis() >= deadline {
                cn_warn!(pipe, token = %token, deadline = deadline, "deadline passed during invocation, result discarded");
                self.capture_expired(token);
                return Ok(());
            }
        }

        // Restrict the output to the declared produced attributes.
        let produced = engine.produced_attributes(&self.operation);
        if !produced.is_empty() {
            if let Some(rogue) = output.keys().find(|k| !produced.contains(k)) {
                cn_warn!(pipe, token = %token, attribute = %rogue, "service produced undeclared attribute");
                self.capture_error(token, "BindingViolation");
                return Ok(());
            }
        }

        match self
            .publisher
            .publish(&engine, &envelope, output, deadline)
            .await
        {
            Ok(outcome) => {
                cn_debug!(pipe, token = %token, outcome = ?outcome, "token published");
                Ok(())
            }
            Err(PublishFailure::Coordination(detail)) => {
                cn_error!(pipe, token = %token, detail = %detail, "coordination invariant violated");
                self.cancel.cancel();
                anyhow::bail!("coordination error: {detail}");
            }
            Err(PublishFailure::Ambiguous(detail)) => {
                cn_warn!(pipe, token = %token, detail = %detail, "routing ambiguous, token to error sink");
                self.capture_error(token, "RoutingAmbiguous");
                Ok(())
            }
            Err(PublishFailure::NoRoute(detail)) => {
                cn_warn!(pipe, token = %token, detail = %detail, "no route, token to error sink");
                self.capture_error(token, "NoRoute");
                Ok(())
            }
            Err(PublishFailure::Send(e)) => {
                cn_warn!(conn, token = %token, error = %e, "downstream send failed, token to error sink");
                self.capture_error(token, "SendError");
                Ok(())
            }
        }
    }

    /// Retry transient failures with a bounded, monotonically increasing
    /// delay; permanent failures return immediately.
    async fn invoke_with_retry(
        &self,
        input: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ServiceFailure> {
        let mut attempt = 0u32;
        loop {
            match self.handler.invoke(input).await {
                Ok(output) => return Ok(output),
                Err(ServiceFailure::Transient(msg)) if attempt < self.retry_cap => {
                    attempt += 1;
                    cn_warn!(pipe, attempt = attempt, cap = self.retry_cap, reason = %msg, "transient service failure, retrying");
                    tokio::time::sleep(self.retry_base_delay * attempt).await;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    // -- captures ------------------------------------------------------------

    fn capture_error(&self, token: TokenId, what: &str) {
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: what.to_string(),
            transition_type: TransitionType::Error,
            token_id: token,
            workflow_base: token.version().base(),
            from_place: Some(self.operation.clone()),
            to_place: None,
            fork_decision: None,
            join_state: None,
            buffer_size: None,
        });
    }

    fn capture_expired(&self, token: TokenId) {
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: "EXPIRED".to_string(),
            transition_type: TransitionType::Expired,
            token_id: token,
            workflow_base: token.version().base(),
            from_place: Some(self.operation.clone()),
            to_place: None,
            fork_decision: None,
            join_state: None,
            buffer_size: None,
        });
    }
}
