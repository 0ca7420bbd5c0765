use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use orion_error::compat_prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cn_config::NodeConfig;
use cn_core::{CaptureSink, RuleStore, WorkflowVersion};

use crate::capture_task::{self, CaptureHandle};
use crate::distribution::RuleAgent;
use crate::error::RuntimeResult;
use crate::publisher::Publisher;
use crate::reactor::TokenReactor;
use crate::scheduler::{Scheduler, SchedulerEvent, TokenEnvelope};
use crate::service::ServiceHandler;
use crate::worker::ServiceWorker;

use super::types::TaskGroup;

// ---------------------------------------------------------------------------
// Phase 2: task spawn helpers — each creates channels + spawns its task
// ---------------------------------------------------------------------------

/// Spawn the capture writer; returns the producer handle all other tasks
/// record through.
pub(super) fn spawn_capture_task(
    sink: Arc<dyn CaptureSink>,
    buffer_size: usize,
) -> (CaptureHandle, TaskGroup) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = CaptureHandle::new(tx);
    let mut group = TaskGroup::new("capture");
    group.push(tokio::spawn(async move {
        capture_task::run_capture_writer(rx, sink).await;
        Ok(())
    }));
    (handle, group)
}

/// Spawn the service worker (with its egress publisher). Returns the
/// scheduler-facing ends of the dispatch/idle handshake.
pub(super) async fn spawn_worker_task(
    config: &NodeConfig,
    handler: Arc<dyn ServiceHandler>,
    store: &Arc<RwLock<RuleStore>>,
    capture: &CaptureHandle,
    cancel: CancellationToken,
) -> RuntimeResult<(mpsc::Sender<TokenEnvelope>, mpsc::Receiver<()>, TaskGroup)> {
    let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
    let (idle_tx, idle_rx) = mpsc::channel(1);

    let publisher = Publisher::bind(
        config.node.service.clone(),
        config.node.operation.clone(),
        capture.clone(),
    )
    .await
    .owe_sys()?;

    let worker = ServiceWorker::new(
        dispatch_rx,
        idle_tx,
        handler,
        publisher,
        Arc::clone(store),
        config.node.service.clone(),
        config.node.operation.clone(),
        config.worker.retry_cap,
        config.worker.retry_base_delay.as_duration(),
        capture.clone(),
        cancel,
    );

    let mut group = TaskGroup::new("worker");
    group.push(tokio::spawn(worker.run()));
    Ok((dispatch_tx, idle_rx, group))
}

/// Spawn the priority scheduler. Returns the reactor-facing event sender.
pub(super) fn spawn_scheduler_task(
    config: &NodeConfig,
    idle_rx: mpsc::Receiver<()>,
    dispatch_tx: mpsc::Sender<TokenEnvelope>,
    store: &Arc<RwLock<RuleStore>>,
    capture: &CaptureHandle,
    cancel: CancellationToken,
    fatal: CancellationToken,
) -> (mpsc::Sender<SchedulerEvent>, TaskGroup) {
    let (event_tx, event_rx) = mpsc::channel(256);
    let scheduler = Scheduler::new(
        event_rx,
        idle_rx,
        dispatch_tx,
        Arc::clone(store),
        capture.clone(),
        cancel,
        fatal,
        config.node.service.clone(),
        config.node.operation.clone(),
        config.scheduler.sweep_interval.as_duration(),
        config.scheduler.join_deadline_skew.as_duration().as_millis() as u64,
        config.scheduler.queue_high_watermark,
    );
    let mut group = TaskGroup::new("scheduler");
    group.push(tokio::spawn(scheduler.run()));
    (event_tx, group)
}

/// Spawn the rule distribution agent on the computed rule port. Returns the
/// bound address and the activation sender handed to the reactor.
pub(super) async fn spawn_rule_agent_task(
    config: &NodeConfig,
    store: &Arc<RwLock<RuleStore>>,
    cancel: CancellationToken,
) -> RuntimeResult<(SocketAddr, mpsc::Receiver<WorkflowVersion>, TaskGroup)> {
    let (activation_tx, activation_rx) = mpsc::channel(16);
    let agent = RuleAgent::bind(
        &config.server.bind,
        config.distribution.rule_port(),
        config.distribution.commitment_endpoint.clone(),
        config.node.service.clone(),
        config.node.operation.clone(),
        Arc::clone(store),
        activation_tx,
        cancel,
    )
    .await
    .owe_sys()?;
    let addr = agent.local_addr().owe_sys()?;

    let mut group = TaskGroup::new("rules");
    group.push(tokio::spawn(agent.run()));
    Ok((addr, activation_rx, group))
}

/// Spawn the token ingress reactor. Returns the bound ingress address.
pub(super) async fn spawn_reactor_task(
    config: &NodeConfig,
    store: &Arc<RwLock<RuleStore>>,
    sched_tx: mpsc::Sender<SchedulerEvent>,
    activation_rx: mpsc::Receiver<WorkflowVersion>,
    capture: &CaptureHandle,
    cancel: CancellationToken,
) -> RuntimeResult<(SocketAddr, TaskGroup)> {
    let reactor = TokenReactor::bind(
        &config.server.bind,
        config.server.ingress_port,
        config.node.service.clone(),
        config.node.operation.clone(),
        Arc::clone(store),
        sched_tx,
        activation_rx,
        capture.clone(),
        cancel,
        config.scheduler.park_grace.as_duration(),
    )
    .await
    .owe_sys()?;
    let addr = reactor.local_addr().owe_sys()?;

    let mut group = TaskGroup::new("reactor");
    group.push(tokio::spawn(reactor.run()));
    Ok((addr, group))
}
