use std::path::PathBuf;

use serde::Deserialize;

/// Capture-journal settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Bounded channel capacity between the runtime tasks and the capture
    /// writer. Overflow drops records and emits a single marker.
    pub buffer_size: usize,
    /// Journal file path. Relative paths are resolved against the config
    /// file's parent directory.
    pub journal: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            journal: PathBuf::from("capture.jsonl"),
        }
    }
}
