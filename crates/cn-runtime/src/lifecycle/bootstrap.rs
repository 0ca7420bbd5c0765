use std::path::Path;
use std::sync::{Arc, RwLock};

use orion_error::compat_prelude::*;

use cn_config::NodeConfig;
use cn_core::{CaptureSink, FileCaptureSink, RuleStore};

use crate::error::{RuntimeReason, RuntimeResult};

// ---------------------------------------------------------------------------
// Phase 1: pure construction — no sockets, no tasks
// ---------------------------------------------------------------------------

/// Artifacts from the bootstrap phase, ready for task spawning.
pub(super) struct BootstrapData {
    pub store: Arc<RwLock<RuleStore>>,
    pub capture_sink: Arc<dyn CaptureSink>,
}

/// Build the rule store and open the capture journal.
///
/// The rule store starts empty: every rule base arrives through the
/// distribution agent after the node is up.
pub(super) fn build_node_state(
    config: &NodeConfig,
    base_dir: &Path,
) -> RuntimeResult<BootstrapData> {
    let journal = if config.capture.journal.is_relative() {
        base_dir.join(&config.capture.journal)
    } else {
        config.capture.journal.clone()
    };
    let capture_sink: Arc<dyn CaptureSink> = Arc::new(
        FileCaptureSink::open(&journal).owe(RuntimeReason::Bootstrap)?,
    );
    cn_debug!(conf, journal = %journal.display(), "capture journal open");

    Ok(BootstrapData {
        store: Arc::new(RwLock::new(RuleStore::new())),
        capture_sink,
    })
}
