use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use cn_core::{CaptureRecord, CaptureSink, now_millis};

// ---------------------------------------------------------------------------
// CaptureHandle — non-blocking producer side
// ---------------------------------------------------------------------------

/// Producer handle to the capture journal.
///
/// Backpressure on the journal must never block the scheduler, so `record`
/// uses `try_send` and counts drops. The next successful send is preceded by
/// a single overflow marker carrying the count of lost records.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<CaptureRecord>,
    dropped: Arc<AtomicU64>,
}

impl CaptureHandle {
    pub(crate) fn new(tx: mpsc::Sender<CaptureRecord>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append a record, dropping it (and remembering the loss) if the buffer
    /// is full.
    pub fn record(&self, record: CaptureRecord) {
        let pending = self.dropped.swap(0, Ordering::Relaxed);
        if pending > 0 {
            let marker = CaptureRecord::Overflow {
                timestamp: now_millis(),
                dropped: pending,
            };
            if self.tx.try_send(marker).is_err() {
                self.dropped.fetch_add(pending, Ordering::Relaxed);
            }
        }
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            cn_warn!(pipe, "capture buffer full, record dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drain the capture channel into the sink.
///
/// Shutdown is driven by channel close: when every task holding a
/// [`CaptureHandle`] has exited, `rx.recv()` returns `None` and the writer
/// exits after the final drain.
pub(crate) async fn run_capture_writer(
    mut rx: mpsc::Receiver<CaptureRecord>,
    sink: Arc<dyn CaptureSink>,
) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = sink.append(&record) {
            cn_warn!(pipe, error = %e, "capture sink write failed");
        }
    }
    cn_debug!(sys, "capture writer drained");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
