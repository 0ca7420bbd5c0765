mod bootstrap;
mod signal;
mod spawn;
mod types;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use orion_error::op_context;
use orion_error::prelude::*;
use tokio_util::sync::CancellationToken;

use cn_config::NodeConfig;

use crate::error::RuntimeResult;
use crate::service::ServiceHandler;

// Re-export public API
pub use signal::wait_for_signal;

use bootstrap::build_node_state;
use spawn::{
    spawn_capture_task, spawn_reactor_task, spawn_rule_agent_task, spawn_scheduler_task,
    spawn_worker_task,
};
use types::TaskGroup;

// ---------------------------------------------------------------------------
// ControlNode — the top-level lifecycle handle
// ---------------------------------------------------------------------------

/// Manages the full lifecycle of one control node: bootstrap, run, and
/// graceful shutdown.
///
/// Task groups are stored in start order and joined in reverse (LIFO)
/// during [`wait`](Self::wait), ensuring correct drain sequencing: the
/// ingress sockets stop first, then the scheduler stops handing out
/// tokens, the worker finishes its in-flight invocation, and the capture
/// writer drains last.
pub struct ControlNode {
    cancel: CancellationToken,
    /// Separate cancel token for the scheduler — triggered only after both
    /// ingress tasks have fully stopped, so every admitted token has reached
    /// the scheduler before it decides to exit.
    drain_cancel: CancellationToken,
    groups: Vec<TaskGroup>,
    ingress_addr: SocketAddr,
    rule_addr: SocketAddr,
}

impl ControlNode {
    /// Bootstrap the entire node from a [`NodeConfig`], a base directory
    /// (for resolving the capture journal path), and the local business
    /// service.
    #[tracing::instrument(name = "node.start", skip_all, fields(service = %config.node.service, operation = %config.node.operation))]
    pub async fn start(
        config: NodeConfig,
        base_dir: &Path,
        handler: Arc<dyn ServiceHandler>,
    ) -> RuntimeResult<Self> {
        let mut op = op_context!("node-bootstrap").with_auto_log();
        op.record("service", config.node.service.as_str());
        op.record("operation", config.node.operation.as_str());

        let cancel = CancellationToken::new();
        let drain_cancel = CancellationToken::new();

        // Phase 1: pure construction
        let data = build_node_state(&config, base_dir)?;

        // Phase 2: spawn task groups
        // (start order: capture → worker → scheduler → rules → reactor)
        let mut groups: Vec<TaskGroup> = Vec::with_capacity(5);

        let (capture, capture_group) =
            spawn_capture_task(Arc::clone(&data.capture_sink), config.capture.buffer_size);
        groups.push(capture_group);

        let (dispatch_tx, idle_rx, worker_group) =
            spawn_worker_task(&config, handler, &data.store, &capture, cancel.clone()).await?;
        groups.push(worker_group);

        let (sched_tx, scheduler_group) = spawn_scheduler_task(
            &config,
            idle_rx,
            dispatch_tx,
            &data.store,
            &capture,
            drain_cancel.child_token(),
            cancel.clone(),
        );
        groups.push(scheduler_group);

        let (rule_addr, activation_rx, rules_group) =
            spawn_rule_agent_task(&config, &data.store, cancel.child_token()).await?;
        groups.push(rules_group);

        let (ingress_addr, reactor_group) = spawn_reactor_task(
            &config,
            &data.store,
            sched_tx,
            activation_rx,
            &capture,
            cancel.child_token(),
        )
        .await?;
        groups.push(reactor_group);

        cn_info!(sys,
            ingress = %ingress_addr,
            rules = %rule_addr,
            "control node started"
        );

        op.mark_suc();
        Ok(Self {
            cancel,
            drain_cancel,
            groups,
            ingress_addr,
            rule_addr,
        })
    }

    /// Returns the local token ingress address.
    pub fn ingress_addr(&self) -> SocketAddr {
        self.ingress_addr
    }

    /// Returns the local rule ingress address.
    pub fn rule_addr(&self) -> SocketAddr {
        self.rule_addr
    }

    /// Request graceful shutdown of all tasks.
    pub fn shutdown(&self) {
        cn_info!(sys, "initiating graceful shutdown");
        self.cancel.cancel();
    }

    /// Wait for all task groups to complete after shutdown.
    ///
    /// Groups are joined in LIFO order (reverse of start order):
    /// reactor → rules → scheduler → worker → capture.
    ///
    /// Two-phase shutdown: both ingress tasks are joined first, ensuring
    /// every admitted token has been handed to the scheduler. Only then is
    /// the scheduler cancelled; closing its channels lets the worker and
    /// the capture writer drain and exit in turn.
    pub async fn wait(mut self) -> RuntimeResult<()> {
        while let Some(group) = self.groups.pop() {
            let name = group.name;
            cn_debug!(sys, task_group = name, "waiting for task group to finish");
            group.wait().await?;
            cn_debug!(sys, task_group = name, "task group finished");

            if name == "rules" {
                // Both ingress sockets are closed — nothing new can arrive.
                // Now let the scheduler stop handing out tokens.
                self.drain_cancel.cancel();
            }
        }
        Ok(())
    }

    /// Returns a clone of the root cancellation token (for signal integration).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
