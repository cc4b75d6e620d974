// crates/memori/src/rate_limit.rs
// Per-tenant rate limits and resource quotas, checked before expensive
// operations.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};

use crate::error::{MemoriError, Result};

/// Default operation rate: calls per window per (user, op).
pub const DEFAULT_RATE_LIMIT: u32 = 100;
/// Default rate window.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
/// Default storage quota per user (bytes).
pub const DEFAULT_STORAGE_LIMIT_BYTES: u64 = 100_000_000;
/// Default memory-count quota per user.
pub const DEFAULT_MEMORY_COUNT_LIMIT: u64 = 10_000;
/// Default daily API-call quota per user; resets at midnight UTC.
pub const DEFAULT_API_CALL_LIMIT: u64 = 1_000;

/// One sliding rate window for a (user, op) pair.
#[derive(Debug)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

impl RateWindow {
    fn new(window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: Instant::now() + window,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.reset_at
    }

    fn reset(&mut self, window: Duration) {
        self.count = 0;
        self.reset_at = Instant::now() + window;
    }
}

/// Cumulative resource usage for one user.
#[derive(Debug, Default, Clone)]
pub struct QuotaUsage {
    pub memory_count: u64,
    pub storage_bytes: u64,
    pub api_calls_today: u64,
    last_reset_day: Option<NaiveDate>,
}

impl QuotaUsage {
    fn roll_daily(&mut self) {
        let today = Utc::now().date_naive();
        if self.last_reset_day != Some(today) {
            self.api_calls_today = 0;
            self.last_reset_day = Some(today);
        }
    }
}

/// Kind of cumulative quota to increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    MemoryCount,
    StorageBytes,
    ApiCalls,
}

/// Thread-safe per-tenant rate limiter with resource quota tracking.
///
/// Rate windows reset on first access after expiry. Violations raise typed
/// errors; callers decide whether to surface or degrade.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
    quotas: Mutex<HashMap<String, QuotaUsage>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            quotas: Mutex::new(HashMap::new()),
        }
    }

    /// Check the (user, op) rate limit and count this call against it.
    pub fn check_rate_limit(
        &self,
        user_id: &str,
        operation: &str,
        limit: u32,
        window: Duration,
    ) -> Result<()> {
        let key = format!("{user_id}:{operation}");
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let entry = windows.entry(key).or_insert_with(|| RateWindow::new(window));

        if entry.is_expired() {
            entry.reset(window);
        }

        if entry.count >= limit {
            let wait = entry.reset_at.saturating_duration_since(Instant::now());
            tracing::warn!(user_id, operation, "rate limit exceeded");
            return Err(MemoriError::RateLimitExceeded(format!(
                "{operation}: limit {limit} per {}s, try again in {}s",
                window.as_secs(),
                wait.as_secs()
            )));
        }

        entry.count += 1;
        Ok(())
    }

    /// Check that adding `additional_bytes` stays within the storage quota.
    pub fn check_storage_quota(
        &self,
        user_id: &str,
        additional_bytes: u64,
        limit_bytes: u64,
    ) -> Result<()> {
        let quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        let used = quotas.get(user_id).map(|q| q.storage_bytes).unwrap_or(0);
        if used + additional_bytes > limit_bytes {
            tracing::warn!(user_id, used, limit_bytes, "storage quota exceeded");
            return Err(MemoriError::QuotaExceeded(format!(
                "storage: {:.1}MB used of {:.1}MB",
                used as f64 / 1_000_000.0,
                limit_bytes as f64 / 1_000_000.0
            )));
        }
        Ok(())
    }

    /// Check the per-user memory count quota.
    pub fn check_memory_count_quota(&self, user_id: &str, limit: u64) -> Result<()> {
        let quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        let count = quotas.get(user_id).map(|q| q.memory_count).unwrap_or(0);
        if count >= limit {
            tracing::warn!(user_id, count, limit, "memory count quota exceeded");
            return Err(MemoriError::QuotaExceeded(format!(
                "memory count: limit {limit} rows per user"
            )));
        }
        Ok(())
    }

    /// Check the daily API-call quota. Counters reset at midnight UTC.
    pub fn check_api_call_quota(&self, user_id: &str, limit: u64) -> Result<()> {
        let mut quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        let usage = quotas.entry(user_id.to_string()).or_default();
        usage.roll_daily();
        if usage.api_calls_today >= limit {
            tracing::warn!(user_id, limit, "daily API call quota exceeded");
            return Err(MemoriError::QuotaExceeded(format!(
                "API calls: limit {limit} per day, resets at midnight UTC"
            )));
        }
        Ok(())
    }

    /// Count usage against a quota after a successful operation.
    pub fn increment(&self, user_id: &str, kind: QuotaKind, amount: u64) {
        let mut quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        let usage = quotas.entry(user_id.to_string()).or_default();
        match kind {
            QuotaKind::MemoryCount => usage.memory_count += amount,
            QuotaKind::StorageBytes => usage.storage_bytes += amount,
            QuotaKind::ApiCalls => {
                usage.roll_daily();
                usage.api_calls_today += amount;
            }
        }
    }

    /// Current usage snapshot for a user.
    pub fn usage(&self, user_id: &str) -> QuotaUsage {
        let mut quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        let usage = quotas.entry(user_id.to_string()).or_default();
        usage.roll_daily();
        usage.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_allows_under_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter
                .check_rate_limit("alice", "search", 5, DEFAULT_RATE_WINDOW)
                .unwrap();
        }
    }

    #[test]
    fn test_rate_limit_blocks_over_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter
                .check_rate_limit("alice", "record", 3, DEFAULT_RATE_WINDOW)
                .unwrap();
        }
        let err = limiter
            .check_rate_limit("alice", "record", 3, DEFAULT_RATE_WINDOW)
            .unwrap_err();
        assert!(matches!(err, MemoriError::RateLimitExceeded(_)));
    }

    #[test]
    fn test_rate_limit_is_per_operation() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter
                .check_rate_limit("alice", "record", 3, DEFAULT_RATE_WINDOW)
                .unwrap();
        }
        // Different operation, same user: unaffected.
        limiter
            .check_rate_limit("alice", "search", 3, DEFAULT_RATE_WINDOW)
            .unwrap();
    }

    #[test]
    fn test_rate_window_resets_after_expiry() {
        let limiter = RateLimiter::new();
        let window = Duration::from_millis(10);
        limiter.check_rate_limit("alice", "op", 1, window).unwrap();
        assert!(limiter.check_rate_limit("alice", "op", 1, window).is_err());
        std::thread::sleep(Duration::from_millis(20));
        limiter.check_rate_limit("alice", "op", 1, window).unwrap();
    }

    #[test]
    fn test_storage_quota() {
        let limiter = RateLimiter::new();
        limiter.check_storage_quota("alice", 500, 1000).unwrap();
        limiter.increment("alice", QuotaKind::StorageBytes, 800);
        let err = limiter.check_storage_quota("alice", 500, 1000).unwrap_err();
        assert!(matches!(err, MemoriError::QuotaExceeded(_)));
    }

    #[test]
    fn test_memory_count_quota() {
        let limiter = RateLimiter::new();
        limiter.increment("alice", QuotaKind::MemoryCount, 10);
        assert!(limiter.check_memory_count_quota("alice", 10).is_err());
        assert!(limiter.check_memory_count_quota("alice", 11).is_ok());
        // Other users are unaffected.
        assert!(limiter.check_memory_count_quota("bob", 10).is_ok());
    }

    #[test]
    fn test_api_call_quota() {
        let limiter = RateLimiter::new();
        limiter.increment("alice", QuotaKind::ApiCalls, 3);
        assert!(limiter.check_api_call_quota("alice", 3).is_err());
        assert!(limiter.check_api_call_quota("alice", 4).is_ok());
    }

    #[test]
    fn test_usage_snapshot() {
        let limiter = RateLimiter::new();
        limiter.increment("alice", QuotaKind::MemoryCount, 2);
        limiter.increment("alice", QuotaKind::StorageBytes, 42);
        let usage = limiter.usage("alice");
        assert_eq!(usage.memory_count, 2);
        assert_eq!(usage.storage_bytes, 42);
    }
}
