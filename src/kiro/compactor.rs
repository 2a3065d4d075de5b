//! History compactor
//!
//! Multi-strategy compaction of the already-translated upstream history so
//! a request fits the upstream input budget, plus an LRU summary cache.
//! Strategies mirror the donor-adjacent Kiro proxy's history manager:
//! auto-truncate, smart-summary, pre-estimate, error-retry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::kiro::model::requests::conversation::{
    AssistantMessage, HistoryAssistantMessage, HistoryUserMessage, Message, UserMessage,
};

/// A single compaction strategy. Any subset may be enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    AutoTruncate,
    SmartSummary,
    ErrorRetry,
    PreEstimate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactorConfig {
    #[serde(default = "default_strategies")]
    pub strategies: Vec<Strategy>,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_summary_keep_recent")]
    pub summary_keep_recent: usize,
    #[serde(default = "default_summary_threshold_chars")]
    pub summary_threshold_chars: usize,
    #[serde(default = "default_summary_max_length")]
    pub summary_max_length: usize,
    #[serde(default = "default_retry_max_messages")]
    pub retry_max_messages: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_estimate_threshold_chars")]
    pub estimate_threshold_chars: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
    #[serde(default = "default_true")]
    pub summary_cache_enabled: bool,
    #[serde(default = "default_delta_msgs")]
    pub summary_cache_delta_messages: usize,
    #[serde(default = "default_delta_chars")]
    pub summary_cache_delta_chars: usize,
    #[serde(default = "default_cache_max_age_secs")]
    pub summary_cache_max_age_secs: u64,
}

fn default_strategies() -> Vec<Strategy> {
    vec![Strategy::ErrorRetry]
}
fn default_max_messages() -> usize {
    50
}
fn default_max_chars() -> usize {
    600_000
}
fn default_summary_keep_recent() -> usize {
    10
}
fn default_summary_threshold_chars() -> usize {
    400_000
}
fn default_summary_max_length() -> usize {
    2000
}
fn default_retry_max_messages() -> usize {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_estimate_threshold_chars() -> usize {
    650_000
}
fn default_chars_per_token() -> f64 {
    3.0
}
fn default_true() -> bool {
    true
}
fn default_delta_msgs() -> usize {
    3
}
fn default_delta_chars() -> usize {
    4000
}
fn default_cache_max_age_secs() -> u64 {
    180
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            max_messages: default_max_messages(),
            max_chars: default_max_chars(),
            summary_keep_recent: default_summary_keep_recent(),
            summary_threshold_chars: default_summary_threshold_chars(),
            summary_max_length: default_summary_max_length(),
            retry_max_messages: default_retry_max_messages(),
            max_retries: default_max_retries(),
            estimate_threshold_chars: default_estimate_threshold_chars(),
            chars_per_token: default_chars_per_token(),
            summary_cache_enabled: default_true(),
            summary_cache_delta_messages: default_delta_msgs(),
            summary_cache_delta_chars: default_delta_chars(),
            summary_cache_max_age_secs: default_cache_max_age_secs(),
        }
    }
}

impl CompactorConfig {
    pub fn enabled(&self, strategy: Strategy) -> bool {
        self.strategies.contains(&strategy)
    }

    /// Admin-surface diagnostic: human description of the active strategy
    /// set, not part of the compaction algorithm itself.
    pub fn describe_strategy(&self) -> String {
        if self.strategies.is_empty() {
            return "none".to_string();
        }
        self.strategies
            .iter()
            .map(|s| format!("{:?}", s))
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// Summarizer contract: given turns, produce a prose summary. The
/// real implementation calls the upstream via the `short` client with
/// `claude-haiku-4.5` and MUST NOT recurse into compaction.
pub trait Summarizer {
    fn summarize(&self, turns: &[Message], max_len: usize) -> anyhow::Result<String>;
}

#[derive(Clone)]
struct SummaryCacheEntry {
    summary: String,
    prefix_message_count: usize,
    prefix_char_count: usize,
    updated_at: Instant,
}

/// LRU summary cache keyed by `(session fingerprint, target-keep-count)`.
pub struct SummaryCache {
    max_entries: usize,
    entries: Mutex<indexmap_lru::LruMap<String, SummaryCacheEntry>>,
}

/// Minimal insertion-ordered map with LRU eviction, avoiding a new
/// dependency (the donor stack has no `lru`/`indexmap` crate).
mod indexmap_lru {
    use std::collections::HashMap;

    pub struct LruMap<K, V> {
        order: Vec<K>,
        map: HashMap<K, V>,
        cap: usize,
    }

    impl<K: Eq + std::hash::Hash + Clone, V> LruMap<K, V> {
        pub fn new(cap: usize) -> Self {
            Self {
                order: Vec::new(),
                map: HashMap::new(),
                cap,
            }
        }

        pub fn get(&mut self, key: &K) -> Option<&V> {
            if self.map.contains_key(key) {
                self.touch(key);
            }
            self.map.get(key)
        }

        pub fn insert(&mut self, key: K, value: V) {
            if !self.map.contains_key(&key) {
                self.order.push(key.clone());
            } else {
                self.touch(&key);
            }
            self.map.insert(key, value);
            while self.map.len() > self.cap {
                if self.order.is_empty() {
                    break;
                }
                let oldest = self.order.remove(0);
                self.map.remove(&oldest);
            }
        }

        fn touch(&mut self, key: &K) {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                let k = self.order.remove(pos);
                self.order.push(k);
            }
        }
    }
}

impl SummaryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: Mutex::new(indexmap_lru::LruMap::new(max_entries.max(1))),
        }
    }

    /// Returns a cached summary iff the pre-summary prefix grew by fewer
    /// than `delta_messages`/`delta_chars` and the entry isn't older than
    /// `max_age`.
    pub fn get(
        &self,
        key: &str,
        prefix_message_count: usize,
        prefix_char_count: usize,
        delta_messages: usize,
        delta_chars: usize,
        max_age: Duration,
    ) -> Option<String> {
        let mut entries = self.entries.lock();
        let entry = entries.get(&key.to_string())?.clone();

        if max_age > Duration::ZERO && entry.updated_at.elapsed() > max_age {
            return None;
        }
        if prefix_message_count.saturating_sub(entry.prefix_message_count) >= delta_messages {
            return None;
        }
        if prefix_char_count.saturating_sub(entry.prefix_char_count) >= delta_chars {
            return None;
        }
        Some(entry.summary)
    }

    pub fn set(
        &self,
        key: impl Into<String>,
        summary: impl Into<String>,
        prefix_message_count: usize,
        prefix_char_count: usize,
    ) {
        self.entries.lock().insert(
            key.into(),
            SummaryCacheEntry {
                summary: summary.into(),
                prefix_message_count,
                prefix_char_count,
                updated_at: Instant::now(),
            },
        );
    }
}

impl Default for SummaryCache {
    fn default() -> Self {
        Self::new(128)
    }
}

/// Total character size of a translated history (approximate, for budget
/// checks — sums text content plus a fixed per-message overhead).
pub fn history_chars(history: &[Message]) -> usize {
    history
        .iter()
        .map(|m| match m {
            Message::User(u) => message_chars_user(u),
            Message::Assistant(a) => message_chars_assistant(a),
        })
        .sum()
}

fn message_chars_user(m: &HistoryUserMessage) -> usize {
    let u = &m.user_input_message;
    u.content.chars().count()
        + u.user_input_message_context
            .tool_results
            .iter()
            .map(|r| serde_json::to_string(&r.content).map(|s| s.chars().count()).unwrap_or(0))
            .sum::<usize>()
}

fn message_chars_assistant(m: &HistoryAssistantMessage) -> usize {
    let a = &m.assistant_response_message;
    a.content.chars().count()
        + a.tool_uses
            .as_ref()
            .map(|t| t.iter().map(|u| u.input.to_string().chars().count()).sum())
            .unwrap_or(0)
}

/// `auto-truncate`: drop oldest entries until `len <= max_messages` AND
/// `char_size <= max_chars`.
pub fn truncate_by_count(history: &[Message], max_count: usize) -> Vec<Message> {
    if history.len() <= max_count {
        return history.to_vec();
    }
    history[history.len() - max_count..].to_vec()
}

pub fn truncate_by_chars(history: &[Message], max_chars: usize) -> Vec<Message> {
    let mut total = 0usize;
    let mut kept: Vec<Message> = Vec::new();
    for msg in history.iter().rev() {
        let size = match msg {
            Message::User(u) => message_chars_user(u),
            Message::Assistant(a) => message_chars_assistant(a),
        };
        if total + size > max_chars && !kept.is_empty() {
            break;
        }
        total += size;
        kept.push(msg.clone());
    }
    kept.reverse();
    kept
}

/// Synthetic `[user: summary][assistant: ack]` pair used to preserve
/// alternation after dropping a prefix.
pub fn summary_pair(summary: &str, model_id: &str) -> (Message, Message) {
    let user = Message::User(HistoryUserMessage {
        user_input_message: UserMessage::new(format!("[Earlier conversation summary]\n{}", summary), model_id),
    });
    let assistant = Message::Assistant(HistoryAssistantMessage {
        assistant_response_message: AssistantMessage::new("Understood, continuing from that summary."),
    });
    (user, assistant)
}

/// Result of a compaction pass.
pub struct CompactionOutcome {
    pub history: Vec<Message>,
    pub truncated: bool,
}

/// `auto-truncate` + optional summarization of the dropped prefix.
pub fn auto_truncate(
    history: &[Message],
    config: &CompactorConfig,
    model_id: &str,
    summarizer: Option<&dyn Summarizer>,
) -> CompactionOutcome {
    if history.len() <= config.max_messages && history_chars(history) <= config.max_chars {
        return CompactionOutcome {
            history: history.to_vec(),
            truncated: false,
        };
    }

    let by_count = truncate_by_count(history, config.max_messages);
    let kept = truncate_by_chars(&by_count, config.max_chars);

    let dropped_count = history.len().saturating_sub(kept.len());
    if dropped_count == 0 {
        return CompactionOutcome {
            history: kept,
            truncated: true,
        };
    }

    let prefix = &history[..dropped_count];
    let mut result = Vec::new();
    if let Some(summarizer) = summarizer {
        if let Ok(summary) = summarizer.summarize(prefix, config.summary_max_length) {
            let (u, a) = summary_pair(&summary, model_id);
            result.push(u);
            result.push(a);
        }
    }
    result.extend(kept);

    CompactionOutcome {
        history: result,
        truncated: true,
    }
}

/// `smart-summary`: triggers when total chars > threshold AND len > keep_recent.
pub fn should_smart_summarize(history: &[Message], config: &CompactorConfig) -> bool {
    history_chars(history) > config.summary_threshold_chars && history.len() > config.summary_keep_recent
}

pub fn smart_summary(
    history: &[Message],
    config: &CompactorConfig,
    model_id: &str,
    summarizer: &dyn Summarizer,
) -> anyhow::Result<CompactionOutcome> {
    let keep_recent = config.summary_keep_recent.min(history.len());
    let split = history.len() - keep_recent;
    let prefix = &history[..split];
    let recent = &history[split..];

    let summary = summarizer.summarize(prefix, config.summary_max_length)?;
    let (u, a) = summary_pair(&summary, model_id);

    let mut result = vec![u, a];
    result.extend_from_slice(recent);

    Ok(CompactionOutcome {
        history: result,
        truncated: true,
    })
}

/// `pre-estimate`: if `total_chars(history) + len(current_user) > threshold`,
/// truncate to 80% of the threshold by chars.
pub fn pre_estimate(history: &[Message], current_user_len: usize, config: &CompactorConfig) -> CompactionOutcome {
    let total = history_chars(history) + current_user_len;
    if total <= config.estimate_threshold_chars {
        return CompactionOutcome {
            history: history.to_vec(),
            truncated: false,
        };
    }

    let target = (config.estimate_threshold_chars as f64 * 0.8) as usize;
    CompactionOutcome {
        history: truncate_by_chars(history, target),
        truncated: true,
    }
}

/// `error-retry`: activated after a `CONTENT_TOO_LONG` error. On retry
/// attempt `k` (0-based), keep the last `max(5, retry_max_messages * (1 - 0.3k))`
/// turns.
pub fn error_retry_target(retry_count: u32, config: &CompactorConfig) -> usize {
    let factor = 1.0 - (retry_count as f64 * 0.3);
    let scaled = (config.retry_max_messages as f64 * factor.max(0.0)) as usize;
    scaled.max(5)
}

pub fn error_retry(
    history: &[Message],
    retry_count: u32,
    config: &CompactorConfig,
    model_id: &str,
    cache_key: Option<&str>,
    cache: Option<&SummaryCache>,
    summarizer: Option<&dyn Summarizer>,
) -> CompactionOutcome {
    let target = error_retry_target(retry_count, config);
    let kept = truncate_by_count(history, target);
    let dropped_count = history.len().saturating_sub(kept.len());

    if dropped_count == 0 {
        let truncated = history.len() != kept.len();
        return CompactionOutcome {
            history: kept,
            truncated,
        };
    }

    let prefix = &history[..dropped_count];
    let prefix_chars = history_chars(prefix);

    let cached = cache_key.zip(cache).and_then(|(key, cache)| {
        if !config.summary_cache_enabled {
            return None;
        }
        cache.get(
            key,
            dropped_count,
            prefix_chars,
            config.summary_cache_delta_messages,
            config.summary_cache_delta_chars,
            Duration::from_secs(config.summary_cache_max_age_secs),
        )
    });

    let summary = cached.or_else(|| {
        let summarizer = summarizer?;
        let generated = summarizer.summarize(prefix, config.summary_max_length).ok()?;
        if let (Some(key), Some(cache)) = (cache_key, cache) {
            if config.summary_cache_enabled {
                cache.set(key, generated.clone(), dropped_count, prefix_chars);
            }
        }
        Some(generated)
    });

    let mut result = Vec::new();
    if let Some(summary) = summary {
        let (u, a) = summary_pair(&summary, model_id);
        result.push(u);
        result.push(a);
    }
    result.extend(kept);

    CompactionOutcome {
        history: result,
        truncated: true,
    }
}

/// Runs the repair pass (alternation + tool-use/tool-result pairing)
/// unconditionally after any compaction, as required by its last line.
pub fn repair(history: Vec<Message>) -> Vec<Message> {
    super::history_repair::repair_history(history)
}

/// Re-compacts a fully-serialized upstream request body after a
/// `CONTENT_LENGTH_EXCEEDS_THRESHOLD` response (retry with a
/// shrunk history). Returns `None` if the body can't be parsed or the
/// error-retry strategy isn't enabled, in which case the caller should
/// surface the original error instead of retrying blindly.
pub fn retry_with_compacted_history(
    request_body: &str,
    retry_count: u32,
    config: &CompactorConfig,
    cache_key: Option<&str>,
    cache: Option<&SummaryCache>,
) -> Option<String> {
    if !config.enabled(Strategy::ErrorRetry) {
        return None;
    }

    let mut request: crate::kiro::model::requests::kiro::KiroRequest =
        serde_json::from_str(request_body).ok()?;
    let state = &mut request.conversation_state;
    let model_id = state.current_message.user_input_message.model_id.clone();

    let outcome = error_retry(&state.history, retry_count, config, &model_id, cache_key, cache, None);
    if !outcome.truncated {
        return None;
    }

    state.history = repair(outcome.history);
    serde_json::to_string(&request).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Message {
        Message::User(HistoryUserMessage {
            user_input_message: UserMessage::new(content, "claude-sonnet-4"),
        })
    }

    fn assistant(content: &str) -> Message {
        Message::Assistant(HistoryAssistantMessage {
            assistant_response_message: AssistantMessage::new(content),
        })
    }

    fn turns(n: usize) -> Vec<Message> {
        let mut v = Vec::new();
        for i in 0..n {
            v.push(user(&format!("u{}", i)));
            v.push(assistant(&format!("a{}", i)));
        }
        v
    }

    #[test]
    fn truncate_by_count_keeps_most_recent() {
        let history = turns(10);
        let kept = truncate_by_count(&history, 4);
        assert_eq!(kept.len(), 4);
        assert_eq!(kept, &history[16..]);
    }

    #[test]
    fn truncate_by_count_noop_when_under_limit() {
        let history = turns(2);
        let kept = truncate_by_count(&history, 10);
        assert_eq!(kept.len(), history.len());
    }

    #[test]
    fn auto_truncate_noop_under_budget() {
        let history = turns(2);
        let config = CompactorConfig::default();
        let out = auto_truncate(&history, &config, "claude-sonnet-4", None);
        assert!(!out.truncated);
        assert_eq!(out.history.len(), history.len());
    }

    #[test]
    fn auto_truncate_drops_oldest_over_budget() {
        let history = turns(100);
        let config = CompactorConfig {
            max_messages: 10,
            ..Default::default()
        };
        let out = auto_truncate(&history, &config, "claude-sonnet-4", None);
        assert!(out.truncated);
        assert!(out.history.len() <= 10);
    }

    #[test]
    fn error_retry_target_shrinks_per_attempt() {
        let config = CompactorConfig {
            retry_max_messages: 30,
            ..Default::default()
        };
        assert_eq!(error_retry_target(0, &config), 30);
        assert_eq!(error_retry_target(1, &config), 21);
        assert!(error_retry_target(10, &config) >= 5);
    }

    #[test]
    fn pre_estimate_truncates_to_80_percent() {
        let history = turns(500);
        let config = CompactorConfig {
            estimate_threshold_chars: 100,
            ..Default::default()
        };
        let out = pre_estimate(&history, 0, &config);
        assert!(out.truncated);
        assert!(history_chars(&out.history) <= 80);
    }

    #[test]
    fn pre_estimate_noop_under_threshold() {
        let history = turns(1);
        let config = CompactorConfig::default();
        let out = pre_estimate(&history, 0, &config);
        assert!(!out.truncated);
    }

    #[test]
    fn summary_cache_reuses_within_delta() {
        let cache = SummaryCache::new(128);
        cache.set("session-1:10", "summary text", 20, 5000);
        let hit = cache.get("session-1:10", 21, 5100, 3, 4000, Duration::from_secs(180));
        assert_eq!(hit, Some("summary text".to_string()));
    }

    #[test]
    fn summary_cache_misses_beyond_delta_messages() {
        let cache = SummaryCache::new(128);
        cache.set("session-1:10", "summary text", 20, 5000);
        let hit = cache.get("session-1:10", 30, 5100, 3, 4000, Duration::from_secs(180));
        assert!(hit.is_none());
    }

    #[test]
    fn summary_cache_misses_beyond_delta_chars() {
        let cache = SummaryCache::new(128);
        cache.set("session-1:10", "summary text", 20, 5000);
        let hit = cache.get("session-1:10", 21, 10_000, 3, 4000, Duration::from_secs(180));
        assert!(hit.is_none());
    }

    #[test]
    fn summary_cache_evicts_lru_beyond_capacity() {
        let cache = SummaryCache::new(2);
        cache.set("a", "sa", 1, 1);
        cache.set("b", "sb", 1, 1);
        cache.set("c", "sc", 1, 1);
        // "a" was least recently used and should be evicted.
        assert!(cache.get("a", 1, 1, 3, 4000, Duration::ZERO).is_none());
        assert!(cache.get("c", 1, 1, 3, 4000, Duration::ZERO).is_some());
    }

    #[test]
    fn describe_strategy_lists_enabled_strategies() {
        let config = CompactorConfig {
            strategies: vec![Strategy::AutoTruncate, Strategy::PreEstimate],
            ..Default::default()
        };
        let desc = config.describe_strategy();
        assert!(desc.contains("AutoTruncate"));
        assert!(desc.contains("PreEstimate"));
    }
}
