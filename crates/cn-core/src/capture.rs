use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::joins::JoinStatus;
use crate::token::TokenId;

// ---------------------------------------------------------------------------
// Capture records
// ---------------------------------------------------------------------------

/// What kind of transition firing a [`CaptureRecord::Transition`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// Token entered a place (`T_in_<place>`).
    Entry,
    /// Token left a place (`T_out_<place>`).
    Exit,
    /// Workflow instance ended.
    Terminate,
    /// Token expired (deadline passed).
    Expired,
    /// Token diverted to the error sink.
    Error,
}

/// One journal line. The journal is append-only and consumed by offline
/// analysis, which queries by `(workflow_base, token_id, transition_id,
/// timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum CaptureRecord {
    Transition {
        timestamp: u64,
        transition_id: String,
        transition_type: TransitionType,
        token_id: TokenId,
        workflow_base: u64,
        from_place: Option<String>,
        to_place: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fork_decision: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        join_state: Option<JoinStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        buffer_size: Option<usize>,
    },
    Genealogy {
        parent_id: TokenId,
        child_id: TokenId,
        fork_transition_id: String,
        fork_timestamp: u64,
        workflow_base: u64,
    },
    JoinSync {
        timestamp: u64,
        join_transition_id: String,
        workflow_instance_id: TokenId,
        expected: u32,
        observed: u32,
        status: JoinStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        deadline: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        continuation_token_id: Option<TokenId>,
    },
    /// The capture buffer overflowed; `dropped` records were lost since the
    /// previous marker.
    Overflow { timestamp: u64, dropped: u64 },
}

/// Conventional transition id of a place entry.
pub fn transition_in(place: &str) -> String {
    format!("T_in_{place}")
}

/// Conventional transition id of a place exit.
pub fn transition_out(place: &str) -> String {
    format!("T_out_{place}")
}

// ---------------------------------------------------------------------------
// CaptureSink
// ---------------------------------------------------------------------------

/// Append-only journal destination. Implementations must be cheap enough to
/// call from the capture task's drain loop; they are never called from the
/// scheduler directly.
pub trait CaptureSink: Send + Sync {
    fn append(&self, record: &CaptureRecord) -> Result<()>;
}

/// Appends capture records as JSON Lines to a file.
pub struct FileCaptureSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileCaptureSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl CaptureSink for FileCaptureSink {
    fn append(&self, record: &CaptureRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut w = self.writer.lock().expect("capture sink lock poisoned");
        w.write_all(json.as_bytes())?;
        w.write_all(b"\n")?;
        w.flush()?;
        Ok(())
    }
}

/// Collects records in memory; the sink used by tests and offline-analysis
/// fixtures.
#[derive(Default)]
pub struct MemoryCaptureSink {
    records: Mutex<Vec<CaptureRecord>>,
}

impl MemoryCaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<CaptureRecord> {
        self.records.lock().expect("capture sink lock poisoned").clone()
    }
}

impl CaptureSink for MemoryCaptureSink {
    fn append(&self, record: &CaptureRecord) -> Result<()> {
        self.records
            .lock()
            .expect("capture sink lock poisoned")
            .push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample_transition() -> CaptureRecord {
        CaptureRecord::Transition {
            timestamp: 1_700_000_000_000,
            transition_id: transition_in("assess"),
            transition_type: TransitionType::Entry,
            token_id: TokenId::new(1_000_001),
            workflow_base: 1_000_000,
            from_place: Some("admit".into()),
            to_place: Some("assess".into()),
            fork_decision: None,
            join_state: None,
            buffer_size: Some(0),
        }
    }

    #[test]
    fn transition_serializes_without_empty_options() {
        let json = serde_json::to_string(&sample_transition()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["record"], "transition");
        assert_eq!(parsed["transition_id"], "T_in_assess");
        assert_eq!(parsed["token_id"], 1_000_001);
        assert!(parsed.get("fork_decision").is_none());
        assert!(parsed.get("join_state").is_none());
        assert_eq!(parsed["buffer_size"], 0);
    }

    #[test]
    fn genealogy_round_trips() {
        let record = CaptureRecord::Genealogy {
            parent_id: TokenId::new(1_000_000),
            child_id: TokenId::new(1_000_201),
            fork_transition_id: "intake.split".into(),
            fork_timestamp: 42,
            workflow_base: 1_000_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: CaptureRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn file_sink_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");

        {
            let sink = FileCaptureSink::open(&path).unwrap();
            sink.append(&sample_transition()).unwrap();
            sink.append(&CaptureRecord::Overflow {
                timestamp: 1,
                dropped: 3,
            })
            .unwrap();
        }

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"T_in_assess\""));
        assert!(lines[1].contains("\"overflow\""));
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/journal/capture.jsonl");
        let sink = FileCaptureSink::open(&path).unwrap();
        sink.append(&sample_transition()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn memory_sink_snapshots() {
        let sink = MemoryCaptureSink::new();
        sink.append(&sample_transition()).unwrap();
        assert_eq!(sink.snapshot().len(), 1);
    }
}
