//! Request rate limiter 
//!
//! Per-credential sliding 60s window plus a minimum inter-request gap, and
//! one global 60s window. Disabled by default, matching the donor config's
//! posture of favoring aggressive credential reuse; when disabled the quota
//! ledger's cooldown is also bypassed by the dispatcher.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Minimum seconds between two requests on the same credential.
    #[serde(default = "default_min_interval")]
    pub min_request_interval_secs: f64,
    /// Max requests per credential in a rolling 60s window.
    #[serde(default = "default_max_per_minute")]
    pub max_requests_per_minute: u32,
    /// Max requests across all credentials in a rolling 60s window.
    #[serde(default = "default_global_max_per_minute")]
    pub global_max_requests_per_minute: u32,
    /// Master switch. When false, `can_request` always allows and the
    /// dispatcher must not place credentials into cooldown on 429.
    #[serde(default)]
    pub enabled: bool,
    /// Cooldown seconds used by the dispatcher instead of the quota
    /// ledger's default, only consulted when `enabled`.
    #[serde(default = "default_quota_cooldown")]
    pub quota_cooldown_secs: u64,
}

fn default_min_interval() -> f64 {
    0.5
}
fn default_max_per_minute() -> u32 {
    60
}
fn default_global_max_per_minute() -> u32 {
    120
}
fn default_quota_cooldown() -> u64 {
    30
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_request_interval_secs: default_min_interval(),
            max_requests_per_minute: default_max_per_minute(),
            global_max_requests_per_minute: default_global_max_per_minute(),
            enabled: false,
            quota_cooldown_secs: default_quota_cooldown(),
        }
    }
}

/// Reason a request was denied admission, for logging/client messaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    MinInterval,
    AccountWindow,
    GlobalWindow,
}

impl DenyReason {
    pub fn message(&self, wait: Duration) -> String {
        match self {
            Self::MinInterval => format!("request too fast, wait {:.1}s", wait.as_secs_f64()),
            Self::AccountWindow => "credential request rate too high".to_string(),
            Self::GlobalWindow => "global request rate too high".to_string(),
        }
    }
}

#[derive(Default)]
struct AccountState {
    last_request: Option<Instant>,
    request_times: VecDeque<Instant>,
}

impl AccountState {
    fn requests_in_window(&self, now: Instant) -> usize {
        self.request_times
            .iter()
            .filter(|t| now.duration_since(**t) < WINDOW)
            .count()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.request_times.front() {
            if now.duration_since(*front) >= WINDOW {
                self.request_times.pop_front();
            } else {
                break;
            }
        }
        if self.request_times.len() > 1000 {
            self.request_times.drain(..self.request_times.len() - 1000);
        }
    }
}

pub struct RateLimiter {
    config: Mutex<RateLimitConfig>,
    accounts: Mutex<HashMap<String, AccountState>>,
    global_requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Mutex::new(config),
            accounts: Mutex::new(HashMap::new()),
            global_requests: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config.lock().clone()
    }

    pub fn update_config(&self, config: RateLimitConfig) {
        *self.config.lock() = config;
    }

    /// `can_request(cred) -> (allowed, wait, reason)`.
    pub fn can_request(&self, credential_id: &str) -> (bool, Duration, Option<DenyReason>) {
        let config = self.config.lock().clone();
        if !config.enabled {
            return (true, Duration::ZERO, None);
        }

        let now = Instant::now();
        let mut accounts = self.accounts.lock();
        let state = accounts.entry(credential_id.to_string()).or_default();
        state.prune(now);

        if let Some(last) = state.last_request {
            let since = now.duration_since(last);
            let min_interval = Duration::from_secs_f64(config.min_request_interval_secs.max(0.0));
            if since < min_interval {
                return (false, min_interval - since, Some(DenyReason::MinInterval));
            }
        }

        let account_rpm = state.requests_in_window(now);
        if account_rpm as u32 >= config.max_requests_per_minute {
            return (false, Duration::from_secs(2), Some(DenyReason::AccountWindow));
        }

        let mut global = self.global_requests.lock();
        while let Some(front) = global.front() {
            if now.duration_since(*front) >= WINDOW {
                global.pop_front();
            } else {
                break;
            }
        }
        let global_rpm = global.len() as u32;
        if global_rpm >= config.global_max_requests_per_minute {
            return (false, Duration::from_secs(1), Some(DenyReason::GlobalWindow));
        }

        (true, Duration::ZERO, None)
    }

    /// Records an admitted request so future `can_request` calls see it.
    pub fn record_request(&self, credential_id: &str) {
        let now = Instant::now();
        let mut accounts = self.accounts.lock();
        let state = accounts.entry(credential_id.to_string()).or_default();
        state.last_request = Some(now);
        state.request_times.push_back(now);
        state.prune(now);
        self.global_requests.lock().push_back(now);
    }

    /// Whether the dispatcher should bypass the quota ledger's own
    /// cooldown in favor of this limiter's `quota_cooldown_secs`.
    pub fn should_apply_quota_cooldown(&self) -> bool {
        self.config.lock().enabled
    }

    pub fn quota_cooldown(&self) -> Duration {
        let config = self.config.lock();
        if config.enabled {
            Duration::from_secs(config.quota_cooldown_secs)
        } else {
            Duration::ZERO
        }
    }

    pub fn global_rpm(&self) -> u32 {
        let now = Instant::now();
        self.global_requests
            .lock()
            .iter()
            .filter(|t| now.duration_since(**t) < WINDOW)
            .count() as u32
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default_always_allows() {
        let limiter = RateLimiter::default();
        let (allowed, wait, reason) = limiter.can_request("a");
        assert!(allowed);
        assert_eq!(wait, Duration::ZERO);
        assert!(reason.is_none());
    }

    #[test]
    fn enabled_enforces_min_interval() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            min_request_interval_secs: 10.0,
            ..Default::default()
        });
        let (allowed, _, _) = limiter.can_request("a");
        assert!(allowed);
        limiter.record_request("a");

        let (allowed, _, reason) = limiter.can_request("a");
        assert!(!allowed);
        assert_eq!(reason, Some(DenyReason::MinInterval));
    }

    #[test]
    fn enabled_enforces_per_account_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            min_request_interval_secs: 0.0,
            max_requests_per_minute: 2,
            ..Default::default()
        });
        for _ in 0..2 {
            let (allowed, _, _) = limiter.can_request("a");
            assert!(allowed);
            limiter.record_request("a");
        }
        let (allowed, _, reason) = limiter.can_request("a");
        assert!(!allowed);
        assert_eq!(reason, Some(DenyReason::AccountWindow));
    }

    #[test]
    fn enabled_enforces_global_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            min_request_interval_secs: 0.0,
            max_requests_per_minute: 1000,
            global_max_requests_per_minute: 1,
            ..Default::default()
        });
        let (allowed, _, _) = limiter.can_request("a");
        assert!(allowed);
        limiter.record_request("a");

        let (allowed, _, reason) = limiter.can_request("b");
        assert!(!allowed);
        assert_eq!(reason, Some(DenyReason::GlobalWindow));
    }

    #[test]
    fn quota_cooldown_bypassed_when_disabled() {
        let limiter = RateLimiter::default();
        assert!(!limiter.should_apply_quota_cooldown());
        assert_eq!(limiter.quota_cooldown(), Duration::ZERO);
    }

    #[test]
    fn quota_cooldown_from_config_when_enabled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            quota_cooldown_secs: 45,
            ..Default::default()
        });
        assert!(limiter.should_apply_quota_cooldown());
        assert_eq!(limiter.quota_cooldown(), Duration::from_secs(45));
    }

    #[test]
    fn independent_accounts_do_not_share_min_interval() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            min_request_interval_secs: 10.0,
            ..Default::default()
        });
        limiter.record_request("a");
        let (allowed, _, _) = limiter.can_request("b");
        assert!(allowed);
    }
}
