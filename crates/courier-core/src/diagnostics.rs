//! Human-readable progress lines for whoever started a transfer

use parking_lot::Mutex;
use tracing::info;

/// Receives one line per transfer start and one per terminal failure.
pub trait Diagnostics: Send + Sync {
    fn line(&self, line: &str);
}

/// Forwards lines to `tracing` at INFO
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn line(&self, line: &str) {
        info!(target: "courier::diagnostics", "{}", line);
    }
}

/// Collects lines in memory
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    lines: Mutex<Vec<String>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn line(&self, line: &str) {
        self.lines.lock().push(line.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_diagnostics() {
        let diag = MemoryDiagnostics::new();
        diag.line("copying workspace");
        diag.line("failed");
        assert_eq!(diag.lines(), vec!["copying workspace", "failed"]);
        TracingDiagnostics.line("no subscriber installed");
    }
}
