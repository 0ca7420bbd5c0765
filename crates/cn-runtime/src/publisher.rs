use std::collections::BTreeMap;

use cn_lang::NodeKind;
use tokio::net::UdpSocket;

use cn_core::payload::{Header, JoinAttribute, MonitorEntry, Payload, ServiceRef};
use cn_core::{CaptureRecord, RouteTarget, RuleEngine, TokenId, TransitionType, now_millis};

use crate::capture_task::CaptureHandle;
use crate::scheduler::TokenEnvelope;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum PublishOutcome {
    /// Payloads sent downstream.
    Routed(usize),
    /// The workflow instance ended here (TERMINATE capture emitted).
    Terminated,
    /// Merge guard retired the token (zero egress, by rule).
    Retired,
}

#[derive(Debug)]
pub(crate) enum PublishFailure {
    /// Gateway/Decision did not resolve to exactly one target.
    Ambiguous(String),
    /// No route and no terminal marker — a topology authoring bug.
    NoRoute(String),
    /// Fork/join invariant violated; fatal for the node.
    Coordination(String),
    /// Datagram emission failed.
    Send(std::io::Error),
}

impl std::fmt::Display for PublishFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ambiguous(d) => write!(f, "routing ambiguous: {d}"),
            Self::NoRoute(d) => write!(f, "no route: {d}"),
            Self::Coordination(d) => write!(f, "coordination error: {d}"),
            Self::Send(e) => write!(f, "send error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Egress side of the control node: decides where a completed token goes
/// next, rewrites the payload, and emits one datagram per surviving target.
///
/// Node-type dispatch happens in exactly one place — the `match` in
/// [`publish`](Self::publish).
pub(crate) struct Publisher {
    socket: UdpSocket,
    service: String,
    operation: String,
    capture: CaptureHandle,
}

impl Publisher {
    pub(crate) async fn bind(
        service: String,
        operation: String,
        capture: CaptureHandle,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            service,
            operation,
            capture,
        })
    }

    /// Route and emit the completed token.
    ///
    /// `attributes` is the produced attribute map coming out of the service
    /// invocation; `deadline` is the incoming effective deadline, propagated
    /// onto every outgoing attribute.
    pub(crate) async fn publish(
        &self,
        engine: &RuleEngine,
        envelope: &TokenEnvelope,
        attributes: BTreeMap<String, String>,
        deadline: Option<u64>,
    ) -> Result<PublishOutcome, PublishFailure> {
        let node_type = engine
            .node_type(&self.service, &self.operation)
            .unwrap_or(NodeKind::Pass);
        let token = envelope.payload.header.sequence_id;

        match node_type {
            NodeKind::Join if !envelope.continuation => {
                Err(PublishFailure::Coordination(format!(
                    "join sibling {token} reached the publisher"
                )))
            }
            NodeKind::Fork => self.publish_fork(engine, envelope, attributes, deadline).await,
            NodeKind::Pass | NodeKind::Gateway | NodeKind::Decision | NodeKind::Merge
            | NodeKind::Join => {
                self.publish_linear(engine, envelope, node_type, attributes, deadline)
                    .await
            }
        }
    }

    // -- linear node types --------------------------------------------------

    async fn publish_linear(
        &self,
        engine: &RuleEngine,
        envelope: &TokenEnvelope,
        node_type: NodeKind,
        attributes: BTreeMap<String, String>,
        deadline: Option<u64>,
    ) -> Result<PublishOutcome, PublishFailure> {
        let token = envelope.payload.header.sequence_id;
        let candidates = engine.route_targets(&self.operation, &attributes);

        let targets: Vec<RouteTarget> = match node_type {
            NodeKind::Gateway | NodeKind::Decision => {
                let surviving: Vec<RouteTarget> = candidates
                    .into_iter()
                    .filter(|t| self.target_survives(engine, t, &attributes))
                    .collect();
                if surviving.len() != 1 {
                    return Err(PublishFailure::Ambiguous(format!(
                        "{} targets satisfy the {node_type} guard for token {token}",
                        surviving.len()
                    )));
                }
                surviving
            }
            NodeKind::Merge => {
                let surviving: Vec<RouteTarget> = candidates
                    .into_iter()
                    .filter(|t| self.target_survives(engine, t, &attributes))
                    .collect();
                if surviving.is_empty() {
                    // A merge may legitimately swallow the token.
                    self.capture_terminate(token);
                    return Ok(PublishOutcome::Retired);
                }
                surviving
            }
            _ => candidates,
        };

        if targets.is_empty() {
            return Err(PublishFailure::NoRoute(format!(
                "no target for {}/{} token {token}",
                self.service, self.operation
            )));
        }

        self.capture_exit(token, &targets, None);

        let mut sent = 0usize;
        let mut terminated = false;
        for target in &targets {
            if target.is_terminate() {
                self.capture_terminate(token);
                terminated = true;
                continue;
            }
            self.send_to_target(envelope, target, token, &attributes, deadline)
                .await?;
            sent += 1;
        }

        if sent == 0 && terminated {
            Ok(PublishOutcome::Terminated)
        } else {
            Ok(PublishOutcome::Routed(sent))
        }
    }

    // -- fork ----------------------------------------------------------------

    async fn publish_fork(
        &self,
        engine: &RuleEngine,
        envelope: &TokenEnvelope,
        attributes: BTreeMap<String, String>,
        deadline: Option<u64>,
    ) -> Result<PublishOutcome, PublishFailure> {
        let parent = envelope.payload.header.sequence_id;
        let targets = engine.route_targets(&self.operation, &attributes);
        let arity = targets.len() as u32;
        if targets.iter().any(RouteTarget::is_terminate) {
            return Err(PublishFailure::Coordination(format!(
                "fork {}/{} routes to TERMINATE",
                self.service, self.operation
            )));
        }

        let children = parent
            .fork_children(arity)
            .map_err(|e| PublishFailure::Coordination(e.to_string()))?;

        let fork_transition = format!("{}.{}", self.service, self.operation);
        let now = now_millis();
        for child in &children {
            self.capture.record(CaptureRecord::Genealogy {
                parent_id: parent,
                child_id: *child,
                fork_transition_id: fork_transition.clone(),
                fork_timestamp: now,
                workflow_base: parent.version().base(),
            });
        }

        self.capture_exit(parent, &targets, Some(format!("fork:{arity}")));

        // The parent id is retired here; each child continues along one
        // branch in target order.
        for (child, target) in children.iter().zip(&targets) {
            self.send_to_target(envelope, target, *child, &attributes, deadline)
                .await?;
        }

        Ok(PublishOutcome::Routed(children.len()))
    }

    // -- guard filtering -----------------------------------------------------

    /// A candidate survives Gateway/Decision/Merge filtering iff its declared
    /// `DecisionValue` (when present) matches the token's attribute required
    /// by that target, and the guard named after the target operation holds.
    fn target_survives(
        &self,
        engine: &RuleEngine,
        target: &RouteTarget,
        attributes: &BTreeMap<String, String>,
    ) -> bool {
        if let Some(expected) = engine.decision_value(&target.service, &target.operation) {
            let matched = engine
                .required_attributes(&target.operation)
                .iter()
                .any(|r| attributes.get(r).is_some_and(|v| v == expected));
            if !matched {
                return false;
            }
        }
        engine.evaluate_guard(&target.operation, attributes)
    }

    // -- payload rewrite + emission ------------------------------------------

    async fn send_to_target(
        &self,
        envelope: &TokenEnvelope,
        target: &RouteTarget,
        outgoing_id: TokenId,
        attributes: &BTreeMap<String, String>,
        deadline: Option<u64>,
    ) -> Result<(), PublishFailure> {
        let (host, port) = target
            .address
            .as_ref()
            .ok_or_else(|| PublishFailure::NoRoute(format!("{} has no address", target.operation)))?;

        let outgoing = self.rewrite(envelope, target, outgoing_id, attributes, deadline);
        let xml = outgoing
            .to_xml()
            .map_err(|e| PublishFailure::NoRoute(format!("payload encode: {e}")))?;

        self.socket
            .send_to(xml.as_bytes(), (host.as_str(), *port))
            .await
            .map_err(PublishFailure::Send)?;
        cn_debug!(conn,
            token = %outgoing_id,
            target = %format!("{}/{}", target.service, target.operation),
            "payload published"
        );
        Ok(())
    }

    /// Outgoing payload: header timestamps updated, service rewritten to the
    /// target, monitor data appended, attributes replaced by the produced
    /// set (each carrying the propagated deadline).
    fn rewrite(
        &self,
        envelope: &TokenEnvelope,
        target: &RouteTarget,
        outgoing_id: TokenId,
        attributes: &BTreeMap<String, String>,
        deadline: Option<u64>,
    ) -> Payload {
        let now = now_millis();
        let incoming = &envelope.payload;

        let mut monitor = incoming.monitor.clone();
        monitor.push(MonitorEntry {
            service: self.service.clone(),
            received_at: envelope.received_at,
            dispatched_at: now,
        });

        Payload {
            header: Header {
                sequence_id: outgoing_id,
                rule_base_version: incoming.header.rule_base_version,
                created_at: incoming.header.created_at.or(Some(now)),
                updated_at: Some(now),
            },
            service: ServiceRef {
                service: target.service.clone(),
                operation: target.operation.clone(),
            },
            attributes: attributes
                .iter()
                .map(|(name, value)| JoinAttribute {
                    name: name.clone(),
                    value: value.clone(),
                    not_after: deadline,
                })
                .collect(),
            monitor,
        }
    }

    // -- captures ------------------------------------------------------------

    fn capture_exit(&self, token: TokenId, targets: &[RouteTarget], fork_decision: Option<String>) {
        let to_place = if targets.len() == 1 {
            Some(targets[0].operation.clone())
        } else {
            None
        };
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: cn_core::transition_out(&self.operation),
            transition_type: TransitionType::Exit,
            token_id: token,
            workflow_base: token.version().base(),
            from_place: Some(self.operation.clone()),
            to_place,
            fork_decision,
            join_state: None,
            buffer_size: None,
        });
    }

    fn capture_terminate(&self, token: TokenId) {
        self.capture.record(CaptureRecord::Transition {
            timestamp: now_millis(),
            transition_id: "TERMINATE".to_string(),
            transition_type: TransitionType::Terminate,
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
