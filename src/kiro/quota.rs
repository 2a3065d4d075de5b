//! Quota / cooldown ledger
//!
//! Tracks per-credential rate-limit events and exposes a deterministic
//! cooldown clock. Keyed by credential id; absence of a record means the
//! credential is not cooling down.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Status codes that unconditionally classify a response as a quota event.
const QUOTA_STATUS_CODES: &[u16] = &[429, 503, 529];

/// Case-insensitive substrings that classify an error body as a quota event.
const QUOTA_KEYWORDS: &[&str] = &[
    "rate limit",
    "quota",
    "too many requests",
    "throttl",
    "capacity",
    "overloaded",
    "try again later",
];

/// Default cooldown duration applied by `mark` when none is supplied.
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;

/// One outstanding cooldown entry for a credential.
#[derive(Debug, Clone)]
struct QuotaRecord {
    exceeded_at: Instant,
    cooldown_until: Instant,
    reason: String,
    hit_count: u32,
}

/// Returns true iff `(status, body)` should be classified as a quota event
/// per the quota rule: status in {429, 503, 529} OR body matches a keyword.
pub fn is_quota_event(status: Option<u16>, body: &str) -> bool {
    if let Some(s) = status {
        if QUOTA_STATUS_CODES.contains(&s) {
            return true;
        }
    }
    let lower = body.to_lowercase();
    QUOTA_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Per-credential record of rate-limit events with a deterministic cooldown
/// clock.
pub struct QuotaLedger {
    cooldown: Duration,
    records: Mutex<HashMap<String, QuotaRecord>>,
}

impl QuotaLedger {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown: Duration::from_secs(cooldown_secs),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Sets `cooldown_until = now + cooldown_seconds` for `credential_id`,
    /// using `cooldown_override` if given (used by the rate limiter's
    /// distinct cooldown window or the ledger's own default.
    pub fn mark(&self, credential_id: &str, reason: impl Into<String>) {
        self.mark_for(credential_id, reason, self.cooldown);
    }

    /// Same as [`mark`] but with an explicit cooldown duration.
    pub fn mark_for(&self, credential_id: &str, reason: impl Into<String>, cooldown: Duration) {
        let now = Instant::now();
        let mut records = self.records.lock();
        let hit_count = records
            .get(credential_id)
            .map(|r| r.hit_count + 1)
            .unwrap_or(1);
        records.insert(
            credential_id.to_string(),
            QuotaRecord {
                exceeded_at: now,
                cooldown_until: now + cooldown,
                reason: reason.into(),
                hit_count,
            },
        );
    }

    /// Returns true iff no record exists OR `now >= cooldown_until`,
    /// purging the record lazily on read when it has expired.
    pub fn available(&self, credential_id: &str) -> bool {
        let mut records = self.records.lock();
        match records.get(credential_id) {
            None => true,
            Some(record) => {
                if Instant::now() >= record.cooldown_until {
                    records.remove(credential_id);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Deletes the cooldown record for `credential_id`, if any.
    pub fn restore(&self, credential_id: &str) -> bool {
        self.records.lock().remove(credential_id).is_some()
    }

    /// Remaining cooldown for diagnostics; `None` if not in cooldown.
    pub fn remaining(&self, credential_id: &str) -> Option<Duration> {
        let records = self.records.lock();
        let record = records.get(credential_id)?;
        let now = Instant::now();
        if now >= record.cooldown_until {
            None
        } else {
            Some(record.cooldown_until - now)
        }
    }

    pub fn reason(&self, credential_id: &str) -> Option<String> {
        self.records.lock().get(credential_id).map(|r| r.reason.clone())
    }

    pub fn hit_count(&self, credential_id: &str) -> u32 {
        self.records
            .lock()
            .get(credential_id)
            .map(|r| r.hit_count)
            .unwrap_or(0)
    }

    /// Drops all expired records; returns the number removed. Not required
    /// for correctness (lazy purge on `available` is sufficient) but kept
    /// for the admin stats surface.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| now < r.cooldown_until);
        before - records.len()
    }
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_true_when_no_record() {
        let ledger = QuotaLedger::default();
        assert!(ledger.available("cred-a"));
    }

    #[test]
    fn mark_makes_credential_unavailable() {
        let ledger = QuotaLedger::new(300);
        ledger.mark("cred-a", "429");
        assert!(!ledger.available("cred-a"));
    }

    #[test]
    fn mark_for_short_cooldown_expires() {
        let ledger = QuotaLedger::new(300);
        ledger.mark_for("cred-a", "429", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(25));
        assert!(ledger.available("cred-a"));
    }

    #[test]
    fn restore_clears_cooldown() {
        let ledger = QuotaLedger::new(300);
        ledger.mark("cred-a", "429");
        assert!(ledger.restore("cred-a"));
        assert!(ledger.available("cred-a"));
    }

    #[test]
    fn restore_returns_false_if_absent() {
        let ledger = QuotaLedger::default();
        assert!(!ledger.restore("missing"));
    }

    #[test]
    fn is_quota_event_by_status() {
        assert!(is_quota_event(Some(429), ""));
        assert!(is_quota_event(Some(503), ""));
        assert!(is_quota_event(Some(529), ""));
        assert!(!is_quota_event(Some(400), ""));
    }

    #[test]
    fn is_quota_event_by_keyword_case_insensitive() {
        assert!(is_quota_event(None, "Rate Limit exceeded"));
        assert!(is_quota_event(None, "service is OVERLOADED right now"));
        assert!(!is_quota_event(None, "bad request"));
    }

    #[test]
    fn hit_count_increments_across_marks() {
        let ledger = QuotaLedger::new(300);
        ledger.mark("cred-a", "429");
        assert_eq!(ledger.hit_count("cred-a"), 1);
        ledger.mark("cred-a", "429");
        assert_eq!(ledger.hit_count("cred-a"), 2);
    }

    #[test]
    fn remaining_is_none_once_expired() {
        let ledger = QuotaLedger::new(300);
        ledger.mark_for("cred-a", "x", Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(15));
        assert!(ledger.remaining("cred-a").is_none());
    }
}
