//! Append-only audit trail (spec.md §3, §4.13; SPEC_FULL §C.5).
//!
//! Never affects control flow — every call site fires-and-forgets into this
//! sink. `recent` exists so the CLI can answer "what just happened" without
//! a full query API.

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::AuditLogRow;

#[derive(Default)]
pub struct AuditSink {
    rows: RwLock<Vec<AuditLogRow>>,
}

impl AuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        event: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        metadata: serde_json::Value,
    ) {
        self.rows.write().push(AuditLogRow {
            id: Uuid::now_v7(),
            event: event.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            metadata,
            created_at: Utc::now(),
        });
    }

    /// The `n` most recently recorded rows, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditLogRow> {
        let rows = self.rows.read();
        rows.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recent_returns_newest_first() {
        let sink = AuditSink::new();
        sink.record("execution.started", "execution", "e1", json!({}));
        sink.record("dlq.entry", "job", "j1", json!({}));
        let recent = sink.recent(2);
        assert_eq!(recent[0].event, "dlq.entry");
        assert_eq!(recent[1].event, "execution.started");
    }

    #[test]
    fn recent_is_capped_at_n() {
        let sink = AuditSink::new();
        for i in 0..5 {
            sink.record("tick", "scheduler", i.to_string(), json!({}));
        }
        assert_eq!(sink.recent(2).len(), 2);
        assert_eq!(sink.len(), 5);
    }
}
