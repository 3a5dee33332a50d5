//! Incrementally captured process output
//!
//! Each standard stream gets exactly one [`OutputWriter`], owned by the task
//! draining the pipe, and any number of cloned [`OutputBuffer`] readers.

use std::sync::{Arc, RwLock};

use regex::Regex;

/// Create a connected writer/reader pair
pub fn output_channel() -> (OutputWriter, OutputBuffer) {
    let shared = Arc::new(RwLock::new(Vec::new()));
    (OutputWriter { shared: shared.clone() }, OutputBuffer { shared })
}

/// The single writer side; not cloneable
#[derive(Debug)]
pub struct OutputWriter {
    shared: Arc<RwLock<Vec<u8>>>,
}

impl OutputWriter {
    pub fn append(&self, bytes: &[u8]) {
        let mut buffer = self.shared.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.extend_from_slice(bytes);
    }
}

/// Read-only view of captured output
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    shared: Arc<RwLock<Vec<u8>>>,
}

impl OutputBuffer {
    /// Snapshot of everything captured so far
    pub fn contents(&self) -> String {
        let buffer = self.shared.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn len(&self) -> usize {
        self.shared.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_match(&self, pattern: &Regex) -> bool {
        pattern.is_match(&self.contents())
    }

    /// Last `lines` lines, used for error details
    pub fn tail(&self, lines: usize) -> String {
        let contents = self.contents();
        let all: Vec<&str> = contents.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}
