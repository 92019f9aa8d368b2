use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokenflow_types::{LogAction, LogEntry, OperationDetails, SourceSummary};

/// The append-only activity log, owned by the kernel and passed around
/// explicitly. Sequence numbers are assigned at append time and are
/// globally unique and monotonic.
///
/// Entry epochs are derived (`epoch_base + sim_time`) rather than read from
/// the wall clock, so a replayed run serializes to the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    entries: Vec<LogEntry>,
    epoch_base: i64,
}

impl ActivityLog {
    pub fn new(epoch_base: i64) -> Self {
        Self {
            entries: Vec::new(),
            epoch_base,
        }
    }

    /// The sequence number the next appended entry will receive.
    pub fn next_sequence(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn append(&mut self, draft: EntryDraft) -> u64 {
        let sequence = self.next_sequence();
        self.entries.push(LogEntry {
            sim_time: draft.sim_time,
            epoch_ms: self.epoch_base + draft.sim_time as i64,
            sequence,
            node_id: draft.node_id,
            token_id: draft.token_id,
            action: draft.action,
            value: draft.value,
            source_tokens: draft.source_tokens,
            details: draft.details,
            node_state: draft.node_state,
            buffer_sizes: draft.buffer_sizes,
        });
        sequence
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn epoch_base(&self) -> i64 {
        self.epoch_base
    }
}

/// Everything an append site provides; the log fills in sequence and epoch.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub sim_time: u64,
    pub node_id: String,
    pub token_id: Option<String>,
    pub action: LogAction,
    pub value: serde_json::Value,
    pub source_tokens: Vec<SourceSummary>,
    pub details: Option<OperationDetails>,
    pub node_state: String,
    pub buffer_sizes: BTreeMap<String, usize>,
}

impl EntryDraft {
    pub fn new(
        sim_time: u64,
        node_id: impl Into<String>,
        action: LogAction,
        value: serde_json::Value,
        node_state: impl Into<String>,
    ) -> Self {
        Self {
            sim_time,
            node_id: node_id.into(),
            token_id: None,
            action,
            value,
            source_tokens: Vec::new(),
            details: None,
            node_state: node_state.into(),
            buffer_sizes: BTreeMap::new(),
        }
    }

    pub fn token(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }

    pub fn sources(mut self, source_tokens: Vec<SourceSummary>) -> Self {
        self.source_tokens = source_tokens;
        self
    }

    pub fn details(mut self, details: OperationDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn buffers(mut self, buffer_sizes: BTreeMap<String, usize>) -> Self {
        self.buffer_sizes = buffer_sizes;
        self
    }
}
