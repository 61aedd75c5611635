//! Process-wide TTL debounce for best-effort side writes.
//!
//! Used by the message processor to throttle user upserts: one write
//! per sender key per window. State lives for the runtime's lifetime
//! and is dropped with it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct DebounceMap {
    window: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl DebounceMap {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the caller should act now (and records the
    /// attempt); `false` while the key is still inside its window.
    pub fn should_run(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        // Opportunistic cleanup keeps the map bounded by active keys.
        if last.len() > 10_000 {
            last.retain(|_, t| now.duration_since(*t) < self.window);
        }
        match last.get(key) {
            Some(t) if now.duration_since(*t) < self.window => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.last.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounces_within_window() {
        let map = DebounceMap::new(Duration::from_secs(60));
        assert!(map.should_run("alex"));
        assert!(!map.should_run("alex"));
        assert!(map.should_run("blake"));
    }

    #[test]
    fn expires_after_window() {
        let map = DebounceMap::new(Duration::from_millis(10));
        assert!(map.should_run("alex"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(map.should_run("alex"));
    }
}
