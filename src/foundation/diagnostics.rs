//! Optional diagnostics capability.
//!
//! Devices that can emit validation findings (a driver validation layer, or the software device's
//! write-ownership checks) forward them to a [`DiagnosticSink`] chosen once at startup. No sink
//! means no reporting; devices never look one up at runtime.

use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Short origin tag, e.g. the validation layer name or `"cpu-validation"`.
    pub source: String,
    pub message: String,
}

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, d: Diagnostic) {
        match d.severity {
            Severity::Info => tracing::info!(source = %d.source, "{}", d.message),
            Severity::Warning => tracing::warn!(source = %d.source, "{}", d.message),
            Severity::Error => tracing::error!(source = %d.source, "{}", d.message),
        }
    }
}

/// Keeps every diagnostic in memory; useful in tests and for end-of-run summaries.
#[derive(Debug, Default)]
pub struct CollectingSink {
    items: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.items.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.snapshot()
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, d: Diagnostic) {
        if let Ok(mut items) = self.items.lock() {
            items.push(d);
        }
    }
}

pub(crate) fn emit(
    sink: Option<&Arc<dyn DiagnosticSink>>,
    severity: Severity,
    source: &str,
    message: impl Into<String>,
) {
    if let Some(sink) = sink {
        sink.report(Diagnostic {
            severity,
            source: source.to_string(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/diagnostics.rs"]
mod tests;
