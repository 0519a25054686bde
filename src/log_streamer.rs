//! Per-container log sinks.
//!
//! Steps write human-facing lines here; the default implementation forwards
//! them to the node's structured log with the container's routing metadata
//! attached. Streams are safe for concurrent writers.

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::api::LogConfig;

/// A sink for one container's stdout/stderr streams.
pub trait LogStreamer: Send + Sync {
    fn stdout(&self, line: &str);
    fn stderr(&self, line: &str);
}

/// Forwards container output into the agent's tracing log.
pub struct TracingLogStreamer {
    guid: String,
    source_name: String,
    index: Option<u32>,
}

impl TracingLogStreamer {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            guid: config.guid.clone(),
            source_name: config.source_name.clone(),
            index: config.index,
        }
    }
}

impl LogStreamer for TracingLogStreamer {
    fn stdout(&self, line: &str) {
        info!(
            guid = %self.guid,
            source = %self.source_name,
            index = ?self.index,
            stream = "stdout",
            "{line}"
        );
    }

    fn stderr(&self, line: &str) {
        info!(
            guid = %self.guid,
            source = %self.source_name,
            index = ?self.index,
            stream = "stderr",
            "{line}"
        );
    }
}

/// Collects lines in memory. Test support, also handy for probes.
#[derive(Default)]
pub struct InMemoryLogStreamer {
    lines: Mutex<Vec<(StreamKind, String)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl InMemoryLogStreamer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(StreamKind, String)> {
        self.lines.lock().expect("log lines poisoned").clone()
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(kind, _)| *kind == StreamKind::Stdout)
            .map(|(_, line)| line)
            .collect()
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(kind, _)| *kind == StreamKind::Stderr)
            .map(|(_, line)| line)
            .collect()
    }
}

impl LogStreamer for InMemoryLogStreamer {
    fn stdout(&self, line: &str) {
        self.lines
            .lock()
            .expect("log lines poisoned")
            .push((StreamKind::Stdout, line.to_string()));
    }

    fn stderr(&self, line: &str) {
        self.lines
            .lock()
            .expect("log lines poisoned")
            .push((StreamKind::Stderr, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_streamer_partitions_streams() {
        let streamer = InMemoryLogStreamer::new();
        streamer.stdout("out");
        streamer.stderr("err");
        assert_eq!(streamer.stdout_lines(), vec!["out"]);
        assert_eq!(streamer.stderr_lines(), vec!["err"]);
    }
}
