//! Flow recorder + stats
//!
//! A bounded, write-once-after-completion ring of completed inbound
//! requests, with a filterable query API and rolling aggregate stats.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Pending,
    Streaming,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowError {
    pub kind: String,
    pub message: String,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRecord {
    pub id: String,
    pub protocol: String,
    pub created_at_ms: u64,
    pub first_byte_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub state: FlowState,
    pub model: String,
    pub credential_id: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub error: Option<FlowError>,
    pub bookmarked: bool,
    pub note: Option<String>,
    pub tags: Vec<String>,
}

impl FlowRecord {
    pub fn new(id: impl Into<String>, protocol: impl Into<String>, model: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            protocol: protocol.into(),
            created_at_ms: now_ms,
            first_byte_at_ms: None,
            completed_at_ms: None,
            state: FlowState::Pending,
            model: model.into(),
            credential_id: None,
            input_tokens: None,
            output_tokens: None,
            tool_calls: Vec::new(),
            error: None,
            bookmarked: false,
            note: None,
            tags: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at_ms.map(|end| end.saturating_sub(self.created_at_ms))
    }
}

/// Filter predicate for [`FlowRecorder::query`].
#[derive(Debug, Clone, Default)]
pub struct FlowFilter {
    pub protocol: Option<String>,
    pub model: Option<String>,
    pub credential_id: Option<String>,
    pub state: Option<FlowState>,
    pub has_error: Option<bool>,
    pub bookmarked: Option<bool>,
    pub search_text: Option<String>,
}

impl FlowFilter {
    fn matches(&self, record: &FlowRecord) -> bool {
        if let Some(p) = &self.protocol {
            if &record.protocol != p {
                return false;
            }
        }
        if let Some(m) = &self.model {
            if &record.model != m {
                return false;
            }
        }
        if let Some(c) = &self.credential_id {
            if record.credential_id.as_deref() != Some(c.as_str()) {
                return false;
            }
        }
        if let Some(s) = self.state {
            if record.state != s {
                return false;
            }
        }
        if let Some(has_error) = self.has_error {
            if record.error.is_some() != has_error {
                return false;
            }
        }
        if let Some(bookmarked) = self.bookmarked {
            if record.bookmarked != bookmarked {
                return false;
            }
        }
        if let Some(text) = &self.search_text {
            let text_lower = text.to_lowercase();
            let haystack = format!(
                "{} {} {}",
                record.id,
                record.model,
                record.note.clone().unwrap_or_default()
            )
            .to_lowercase();
            if !haystack.contains(&text_lower) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub total_flows: usize,
    pub completed: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub p50_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

/// Bounded FIFO ring of completed flow records.
pub struct FlowRecorder {
    capacity: usize,
    records: Mutex<VecDeque<FlowRecord>>,
}

impl FlowRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    /// Writes a record once, after completion; evicts the oldest entry if
    /// the ring is at capacity.
    pub fn record(&self, record: FlowRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn query(&self, filter: &FlowFilter, offset: usize, limit: usize) -> Vec<FlowRecord> {
        let records = self.records.lock();
        records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn export_json(&self) -> Vec<FlowRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn export_jsonl(&self) -> String {
        self.records
            .lock()
            .iter()
            .filter_map(|r| serde_json::to_string(r).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn stats(&self) -> FlowStats {
        let records = self.records.lock();
        let total = records.len();
        let completed = records.iter().filter(|r| r.state == FlowState::Completed).count();
        let errors = records.iter().filter(|r| r.error.is_some()).count();
        let error_rate = if total == 0 { 0.0 } else { errors as f64 / total as f64 };

        let mut durations: Vec<u64> = records.iter().filter_map(|r| r.duration_ms()).collect();
        durations.sort_unstable();
        let p50 = durations.get(durations.len() / 2).copied().unwrap_or(0);
        let avg = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let total_input: u64 = records.iter().filter_map(|r| r.input_tokens).sum();
        let total_output: u64 = records.iter().filter_map(|r| r.output_tokens).sum();

        FlowStats {
            total_flows: total,
            completed,
            errors,
            error_rate,
            p50_duration_ms: p50,
            avg_duration_ms: avg,
            total_input_tokens: total_input,
            total_output_tokens: total_output,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FlowRecorder {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Current time in milliseconds since the Unix epoch, for timestamping flow
/// records.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
