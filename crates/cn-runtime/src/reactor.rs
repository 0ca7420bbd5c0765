use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cn_core::{
    CaptureRecord, Payload, RuleStore, TokenId, TransitionType, WorkflowVersion, now_millis,
};

use crate::capture_task::CaptureHandle;
use crate::scheduler::{SchedulerEvent, TokenEnvelope};

/// How often parked tokens are re-checked against their grace deadline.
const PARK_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Datagram receive buffer; payloads are small XML documents.
const RECV_BUFFER: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// TokenReactor
// ---------------------------------------------------------------------------

struct ParkedToken {
    payload: Payload,
    received_at: u64,
    grace_until: Instant,
}

/// UDP token ingress: parses each datagram, runs the admission checks, and
/// forwards admitted tokens to the scheduler.
///
/// Tokens referencing a version that is staged (or entirely unknown) are
/// parked for a short grace period: a promotion event from the rule
/// distribution agent re-admits them, the grace deadline drops them.
pub struct TokenReactor {
    socket: UdpSocket,
    service: String,
    operation: String,
    store: Arc<RwLock<RuleStore>>,
    sched_tx: mpsc::Sender<SchedulerEvent>,
    activation_rx: mpsc::Receiver<WorkflowVersion>,
    capture: CaptureHandle,
    cancel: CancellationToken,
    park_grace: Duration,
    parked: Vec<ParkedToken>,
}

#[allow(clippy::too_many_arguments)]
impl TokenReactor {
    pub(crate) async fn bind(
        bind: &str,
        port: u16,
        service: String,
        operation: String,
        store: Arc<RwLock<RuleStore>>,
        sched_tx: mpsc::Sender<SchedulerEvent>,
        activation_rx: mpsc::Receiver<WorkflowVersion>,
        capture: CaptureHandle,
        cancel: CancellationToken,
        park_grace: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind((bind, port)).await?;
        Ok(Self {
            socket,
            service,
            operation,
            store,
            sched_tx,
            activation_rx,
            capture,
            cancel,
            park_grace,
            parked: Vec::new(),
        })
    }

    /// Returns the local address the ingress socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the ingress loop until cancelled.
    #[tracing::instrument(name = "reactor", skip_all)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut sweep = tokio::time::interval(PARK_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(e) => cn_warn!(conn, error = %e, "ingress receive error"),
                    }
                }
                Some(version) = self.activation_rx.recv() => {
                    self.readmit(version).await;
                }
                _ = sweep.tick() => {
                    self.drop_stale_parks();
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        Ok(())
    }

    // -- admission -----------------------------------------------------------

    async fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        let text = match std::str::from_utf8(datagram) {
            Ok(text) => text,
            Err(_) => {
                cn_warn!(conn, peer = %peer, "non-UTF-8 datagram dropped");
                self.capture_malformed();
                return;
            }
        };
        let payload = match Payload::parse(text) {
            Ok(payload) => payload,
            Err(e) => {
                cn_warn!(conn, peer = %peer, error = %e, "malformed payload dropped");
                self.capture_malformed();
                return;
            }
        };
        cn_trace!(pipe, token = %payload.header.sequence_id, peer = %peer, "payload received");
        self.admit(payload, now_millis()).await;
    }

    async fn admit(&mut self, payload: Payload, received_at: u64) {
        let token = payload.header.sequence_id;

        if payload.service.service != self.service || payload.service.operation != self.operation {
            cn_warn!(pipe,
                token = %token,
                addressed = %format!("{}/{}", payload.service.service, payload.service.operation),
                "payload addressed to a different node, dropped"
            );
            self.capture_error(token, "MisroutedPayload");
            return;
        }

        // A token arriving exactly at its deadline is already expired.
        if let Some(deadline) = payload.effective_deadline() {
            if now_millis() >= deadline {
                cn_debug!(pipe, token = %token, deadline = deadline, "token expired on arrival");
                self.capture_expired(token);
                return;
            }
        }

        let version = payload.header.rule_base_version;
        let active = {
            let store = self.store.read().expect("rule store lock poisoned");
            store.is_active(version)
        };
        if !active {
            cn_debug!(rule, token = %token, version = %version, "rule base not active, parking token");
            self.parked.push(ParkedToken {
                payload,
                received_at,
                grace_until: Instant::now() + self.park_grace,
            });
            return;
        }

        let envelope = TokenEnvelope {
            payload,
            continuation: false,
            received_at,
        };
        if self.sched_tx.send(SchedulerEvent::Admit(envelope)).await.is_err() {
            cn_warn!(pipe, token = %token, "scheduler channel closed, token dropped");
        }
    }

    // -- parked tokens -------------------------------------------------------

    /// A version was promoted: re-admit every parked token that references it.
    async fn readmit(&mut self, version: WorkflowVersion) {
        let mut still_parked = Vec::with_capacity(self.parked.len());
        let mut ready = Vec::new();
        for parked in self.parked.drain(..) {
            if parked.payload.header.rule_base_version == version {
                ready.push(parked);
            } else {
                still_parked.push(parked);
            }
        }
        self.parked = still_parked;

        for parked in ready {
            cn_debug!(rule,
                token = %parked.payload.header.sequence_id,
                version = %version,
                "version activated, re-admitting parked token"
            );
            self.admit(parked.payload, parked.received_at).await;
        }
    }

    /// Drop parked tokens whose grace period elapsed.
    fn drop_stale_parks(&mut self) {
        let now = Instant::now();
        let capture = &self.capture;
        let operation = &self.operation;
        self.parked.retain(|parked| {
            if now < parked.grace_until {
                return true;
            }
            let token = parked.payload.header.sequence_id;
            cn_warn!(rule,
                token = %token,
                version = %parked.payload.header.rule_base_version,
                "rule base still not active, parked token dropped"
            );
            capture.record(CaptureRecord::Transition {
                timestamp: now_millis(),
                transition_id: "RuleBaseNotActive".to_string(),
                transition_type: TransitionType::Error,
                token_id: token,
                workflow_base: token.version().base(),
                from_place: None,
                to_place: Some(operation.clone()),
                fork_decision: None,
                join_state: None,
                buffer_size: None,
            });
            false
        });
    }

    // -- captures ------------------------------------------------------------

    fn capture_malformed(&self) {
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: "MalformedPayload".to_string(),
            transition_type: TransitionType::Error,
            token_id: TokenId::new(0),
            workflow_base: 0,
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

    fn capture_expired(&self, token: TokenId) {
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
}
