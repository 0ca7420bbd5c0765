use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cn_core::{RuleBase, RuleStore, WorkflowVersion};

/// Datagram receive buffer for fragment deliveries.
const RECV_BUFFER: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Fragment envelope
// ---------------------------------------------------------------------------

/// Parsed delivery header: `"<version> <fragmentId> <totalFragments>\n"`
/// followed by the fragment text.
struct FragmentDelivery<'a> {
    version: WorkflowVersion,
    fragment_id: u32,
    total: u32,
    body: &'a [u8],
}

fn parse_delivery(datagram: &[u8]) -> Option<FragmentDelivery<'_>> {
    let newline = datagram.iter().position(|&b| b == b'\n')?;
    let header = std::str::from_utf8(&datagram[..newline]).ok()?;
    let body = &datagram[newline + 1..];

    let mut parts = header.split_ascii_whitespace();
    let version: WorkflowVersion = parts.next()?.parse().ok()?;
    let fragment_id: u32 = parts.next()?.parse().ok()?;
    let total: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || fragment_id == 0 || fragment_id > total {
        return None;
    }
    Some(FragmentDelivery {
        version,
        fragment_id,
        total,
        body,
    })
}

// ---------------------------------------------------------------------------
// RuleAgent
// ---------------------------------------------------------------------------

struct StagingBase {
    total: u32,
    fragments: BTreeMap<u32, Vec<u8>>,
}

/// Rule ingress agent: buffers fragment deliveries per version, promotes a
/// version to active once the set is complete and parses, and ACKs the
/// distributor on the commitment endpoint.
///
/// The agent never drives retransmission — an incomplete version simply
/// stays staged until the distributor resends the gap.
pub struct RuleAgent {
    socket: UdpSocket,
    commitment_endpoint: String,
    service: String,
    operation: String,
    store: Arc<RwLock<RuleStore>>,
    staging: HashMap<WorkflowVersion, StagingBase>,
    committed: HashMap<WorkflowVersion, BTreeMap<u32, Vec<u8>>>,
    activation_tx: mpsc::Sender<WorkflowVersion>,
    cancel: CancellationToken,
}

impl RuleAgent {
    pub(crate) async fn bind(
        bind: &str,
        port: u16,
        commitment_endpoint: String,
        service: String,
        operation: String,
        store: Arc<RwLock<RuleStore>>,
        activation_tx: mpsc::Sender<WorkflowVersion>,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind((bind, port)).await?;
        Ok(Self {
            socket,
            commitment_endpoint,
            service,
            operation,
            store,
            staging: HashMap::new(),
            committed: HashMap::new(),
            activation_tx,
            cancel,
        })
    }

    /// Returns the local address of the rule ingress socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the fragment ingress loop until cancelled.
    #[tracing::instrument(name = "rule_agent", skip_all)]
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(e) => cn_warn!(conn, error = %e, "rule ingress receive error"),
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        Ok(())
    }

    // -- delivery handling ---------------------------------------------------

    async fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        let Some(delivery) = parse_delivery(datagram) else {
            cn_warn!(rule, peer = %peer, "malformed fragment delivery dropped");
            return;
        };
        let version = delivery.version;

        let already_active = {
            let store = self.store.read().expect("rule store lock poisoned");
            store.is_active(version)
        };
        if already_active {
            self.handle_redelivery(&delivery);
            return;
        }

        let staging = self
            .staging
            .entry(version)
            .or_insert_with(|| StagingBase {
                total: delivery.total,
                fragments: BTreeMap::new(),
            });
        if staging.total != delivery.total {
            cn_warn!(rule,
                version = %version,
                expected = staging.total,
                got = delivery.total,
                "fragment delivery disagrees on total, rejected"
            );
            return;
        }
        if let Some(previous) = staging.fragments.get(&delivery.fragment_id) {
            if previous == delivery.body {
                cn_debug!(rule, version = %version, fragment = delivery.fragment_id, "duplicate fragment ignored");
                return;
            }
            cn_warn!(rule, version = %version, fragment = delivery.fragment_id, "staged fragment replaced by differing redelivery");
        }
        staging
            .fragments
            .insert(delivery.fragment_id, delivery.body.to_vec());
        {
            let mut store = self.store.write().expect("rule store lock poisoned");
            store.mark_staged(version);
        }
        cn_debug!(rule,
            version = %version,
            fragment = delivery.fragment_id,
            have = staging.fragments.len(),
            total = staging.total,
            "fragment staged"
        );

        if staging.fragments.len() as u32 == staging.total {
            self.try_commit(version).await;
        }
    }

    /// Redelivery of an already-active version: byte-identical fragments are
    /// dropped, mismatches are a version conflict and the delivery is
    /// rejected.
    fn handle_redelivery(&self, delivery: &FragmentDelivery<'_>) {
        let identical = self
            .committed
            .get(&delivery.version)
            .and_then(|fragments| fragments.get(&delivery.fragment_id))
            .is_some_and(|bytes| bytes == delivery.body);
        if identical {
            cn_debug!(rule, version = %delivery.version, fragment = delivery.fragment_id, "identical redelivery of committed version ignored");
        } else {
            cn_warn!(rule,
                version = %delivery.version,
                fragment = delivery.fragment_id,
                "rule version conflict: differing redelivery of committed version rejected"
            );
        }
    }

    /// All fragments present: parse, build, promote, ACK, announce.
    async fn try_commit(&mut self, version: WorkflowVersion) {
        let staging = self.staging.get(&version).expect("staging just observed");

        let mut text = String::new();
        for body in staging.fragments.values() {
            match std::str::from_utf8(body) {
                Ok(chunk) => {
                    text.push_str(chunk);
                    text.push('\n');
                }
                Err(_) => {
                    cn_warn!(rule, version = %version, "fragment body not UTF-8, version stays staged");
                    return;
                }
            }
        }

        let fragments = match cn_lang::parse_fragments(&text) {
            Ok(fragments) => fragments,
            Err(e) => {
                cn_warn!(rule, version = %version, error = %e, "fragment set failed to parse, version stays staged");
                return;
            }
        };

        // ACK first: a base is active only after this node has voted.
        self.send_ack(version).await;

        let base = RuleBase::build(version, &fragments);
        {
            let mut store = self.store.write().expect("rule store lock poisoned");
            store.promote(base);
        }
        let staging = self.staging.remove(&version).expect("staging just observed");
        self.committed.insert(version, staging.fragments);
        cn_info!(rule, version = %version, fragments = fragments.len(), "rule base committed");

        if self.activation_tx.send(version).await.is_err() {
            cn_debug!(rule, "activation channel closed");
        }
    }

    /// ACK to the distributor: the commitment protocol's per-node vote.
    async fn send_ack(&self, version: WorkflowVersion) {
        let ack = format!("ACK {version} {}/{}", self.service, self.operation);
        match self
            .socket
            .send_to(ack.as_bytes(), self.commitment_endpoint.as_str())
            .await
        {
            Ok(_) => cn_debug!(rule, version = %version, endpoint = %self.commitment_endpoint, "commitment ACK sent"),
            Err(e) => cn_warn!(conn, version = %version, error = %e, "commitment ACK send failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FRAGMENTS_A: &str = r#"NodeType("triage", "assess", pass).
activeService("triage", "assess", "127.0.0.1", 9401)."#;
    const FRAGMENTS_B: &str = r#"canonicalBinding("assess", "severity", "vitals").
canonicalBinding("TERMINATE", "", "severity")."#;

    struct Fixture {
        rule_addr: SocketAddr,
        client: UdpSocket,
        ack_rx: UdpSocket,
        store: Arc<RwLock<RuleStore>>,
        activation_rx: mpsc::Receiver<WorkflowVersion>,
        cancel: CancellationToken,
        agent: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    async fn start_agent() -> Fixture {
        let ack_rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ack_addr = ack_rx.local_addr().unwrap();

        let store = Arc::new(RwLock::new(RuleStore::new()));
        let (activation_tx, activation_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let agent = RuleAgent::bind(
            "127.0.0.1",
            0,
            ack_addr.to_string(),
            "triage".into(),
            "assess".into(),
            Arc::clone(&store),
            activation_tx,
            cancel.clone(),
        )
        .await
        .unwrap();
        let rule_addr = agent.local_addr().unwrap();
        let handle = tokio::spawn(agent.run());

        Fixture {
            rule_addr,
            client: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            ack_rx,
            store,
            activation_rx,
            cancel,
            agent: handle,
        }
    }

    async fn send_fragment(fx: &Fixture, version: &str, id: u32, total: u32, body: &str) {
        let datagram = format!("{version} {id} {total}\n{body}");
        fx.client
            .send_to(datagram.as_bytes(), fx.rule_addr)
            .await
            .unwrap();
    }

    async fn recv_ack(fx: &Fixture) -> String {
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), fx.ack_rx.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..len]).to_string()
    }

    async fn stop(fx: Fixture) {
        fx.cancel.cancel();
        fx.agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn out_of_order_fragments_commit_and_ack() {
        let mut fx = start_agent().await;
        let v1: WorkflowVersion = "v001".parse().unwrap();

        send_fragment(&fx, "v001", 2, 2, FRAGMENTS_B).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.store.read().unwrap().is_staged(v1));
        assert!(!fx.store.read().unwrap().is_active(v1));

        send_fragment(&fx, "v001", 1, 2, FRAGMENTS_A).await;

        let ack = recv_ack(&fx).await;
        assert_eq!(ack, "ACK v001 triage/assess");
        assert_eq!(fx.activation_rx.recv().await, Some(v1));
        assert!(fx.store.read().unwrap().is_active(v1));

        stop(fx).await;
    }

    #[tokio::test]
    async fn byte_identical_redelivery_is_idempotent() {
        let mut fx = start_agent().await;
        let v1: WorkflowVersion = "v001".parse().unwrap();

        send_fragment(&fx, "v001", 1, 1, FRAGMENTS_A).await;
        let _ = recv_ack(&fx).await;
        assert_eq!(fx.activation_rx.recv().await, Some(v1));

        // Identical redelivery: no second activation event.
        send_fragment(&fx, "v001", 1, 1, FRAGMENTS_A).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.activation_rx.try_recv().is_err());
        assert!(fx.store.read().unwrap().is_active(v1));

        stop(fx).await;
    }

    #[tokio::test]
    async fn mismatched_redelivery_is_rejected() {
        let mut fx = start_agent().await;
        let v1: WorkflowVersion = "v001".parse().unwrap();

        send_fragment(&fx, "v001", 1, 1, FRAGMENTS_A).await;
        let _ = recv_ack(&fx).await;
        fx.activation_rx.recv().await.unwrap();

        // Differing bytes for a committed version must not disturb it.
        send_fragment(&fx, "v001", 1, 1, FRAGMENTS_B).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.store.read().unwrap().is_active(v1));
        assert!(fx.activation_rx.try_recv().is_err());

        stop(fx).await;
    }

    #[tokio::test]
    async fn incomplete_version_stays_staged() {
        let fx = start_agent().await;
        let v1: WorkflowVersion = "v001".parse().unwrap();

        send_fragment(&fx, "v001", 1, 3, FRAGMENTS_A).await;
        send_fragment(&fx, "v001", 3, 3, FRAGMENTS_B).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fx.store.read().unwrap().is_staged(v1));
        assert!(!fx.store.read().unwrap().is_active(v1));

        stop(fx).await;
    }

    #[tokio::test]
    async fn concurrent_versions_stage_independently() {
        let mut fx = start_agent().await;
        let v1: WorkflowVersion = "v001".parse().unwrap();
        let v2: WorkflowVersion = "v002".parse().unwrap();

        send_fragment(&fx, "v001", 1, 2, FRAGMENTS_A).await;
        send_fragment(&fx, "v002", 1, 1, FRAGMENTS_A).await;

        let _ = recv_ack(&fx).await;
        assert_eq!(fx.activation_rx.recv().await, Some(v2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.store.read().unwrap().is_staged(v1));
        assert!(fx.store.read().unwrap().is_active(v2));

        stop(fx).await;
    }

    #[test]
    fn delivery_header_rejects_garbage() {
        assert!(parse_delivery(b"no newline at all").is_none());
        assert!(parse_delivery(b"v001 0 2\nbody").is_none());
        assert!(parse_delivery(b"v001 3 2\nbody").is_none());
        assert!(parse_delivery(b"bogus 1 1\nbody").is_none());
        assert!(parse_delivery(b"v001 1 1 extra\nbody").is_none());
        assert!(parse_delivery(b"v001 1 1\nbody").is_some());
    }
}
