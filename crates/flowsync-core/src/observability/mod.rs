//! Observability: metrics, audit trail, log ring (spec.md §4.13).
//!
//! Write-only from the core's perspective — nothing here feeds back into
//! control flow.

mod audit;
mod log;
mod metrics;

pub use audit::AuditSink;
pub use log::{LogBuffer, LogEntry, LogLevel};
pub use metrics::Metrics;

#[derive(Default)]
pub struct Observability {
    pub metrics: Metrics,
    pub audit: AuditSink,
    pub log: LogBuffer,
}

impl Observability {
    pub fn new() -> Self {
        Self::default()
    }
}
