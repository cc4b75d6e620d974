// crates/memori/src/fingerprint.rs
// Conversation dedup net: rejects the same exchange arriving from multiple
// integration hooks within a short window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Window in which an identical fingerprint is treated as a duplicate.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Characters of each side of the exchange that feed the fingerprint.
/// Enough to catch obvious duplicates while tolerating minor tail variation.
const FINGERPRINT_PREFIX_CHARS: usize = 200;

/// Compute the dedup fingerprint for one exchange:
/// sha256(user_input[..200] | ai_output[..200] | session_id), first 16 hex chars.
pub fn conversation_fingerprint(user_input: &str, ai_output: &str, session_id: &str) -> String {
    let user_prefix: String = user_input.chars().take(FINGERPRINT_PREFIX_CHARS).collect();
    let ai_prefix: String = ai_output.chars().take(FINGERPRINT_PREFIX_CHARS).collect();
    let content = format!("{user_prefix}|{ai_prefix}|{session_id}");
    let digest = Sha256::digest(content.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Mutex-guarded fingerprint cache with time-based eviction.
///
/// The check-and-insert is atomic under the lock: concurrent hooks racing on
/// the same exchange see exactly one "fresh" outcome.
pub struct DedupNet {
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl Default for DedupNet {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl DedupNet {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Returns true if the fingerprint was seen within the window
    /// (duplicate); otherwise marks it seen and returns false.
    pub fn check_and_insert(&self, fingerprint: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        // Evict entries older than the window before checking.
        seen.retain(|_, at| now.duration_since(*at) < self.window);

        if seen.contains_key(fingerprint) {
            return true;
        }
        seen.insert(fingerprint.to_string(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = conversation_fingerprint("hello", "world", "s1");
        let b = conversation_fingerprint("hello", "world", "s1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_fingerprint_varies_by_session() {
        let a = conversation_fingerprint("hello", "world", "s1");
        let b = conversation_fingerprint("hello", "world", "s2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_ignores_tail_past_prefix() {
        let long_a = format!("{}{}", "x".repeat(200), "tail one");
        let long_b = format!("{}{}", "x".repeat(200), "different tail");
        assert_eq!(
            conversation_fingerprint(&long_a, "out", "s"),
            conversation_fingerprint(&long_b, "out", "s")
        );
    }

    #[test]
    fn test_fingerprint_handles_multibyte_input() {
        // Must not panic on non-ASCII content near the prefix boundary.
        let input = "日本語のテキスト".repeat(50);
        let fp = conversation_fingerprint(&input, "répønse ünïcode", "s");
        assert_eq!(fp.len(), 16);
    }

    #[test]
    fn test_duplicate_within_window() {
        let net = DedupNet::default();
        let fp = conversation_fingerprint("q", "a", "s");
        assert!(!net.check_and_insert(&fp));
        assert!(net.check_and_insert(&fp));
    }

    #[test]
    fn test_fresh_after_window_expiry() {
        let net = DedupNet::new(Duration::from_millis(10));
        let fp = conversation_fingerprint("q", "a", "s");
        assert!(!net.check_and_insert(&fp));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!net.check_and_insert(&fp));
    }

    #[test]
    fn test_eviction_keeps_cache_bounded() {
        let net = DedupNet::new(Duration::from_millis(10));
        for i in 0..50 {
            net.check_and_insert(&format!("fp-{i}"));
        }
        std::thread::sleep(Duration::from_millis(20));
        net.check_and_insert("fresh");
        assert_eq!(net.len(), 1);
    }

    #[test]
    fn test_concurrent_hooks_record_once() {
        use std::sync::Arc;

        let net = Arc::new(DedupNet::default());
        let fp = conversation_fingerprint("same", "exchange", "s");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let net = net.clone();
                let fp = fp.clone();
                std::thread::spawn(move || !net.check_and_insert(&fp))
            })
            .collect();
        let fresh: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(fresh, 1, "exactly one hook may record the exchange");
    }
}
