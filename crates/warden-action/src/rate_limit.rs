//! Fixed-window rate limiter keyed by action type.
//!
//! Each action type gets a `(count, window_start)` pair. A window older than
//! the configured length is reset on the next check. Bursts straddling a
//! window boundary can reach twice the limit; that is accepted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Window {
    count: u32,
    started: Instant,
}

/// In-process limiter shared by every caller of one router.
pub struct RateLimiter {
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Create a limiter whose windows last `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take a slot for `action_type`. Returns `true` if allowed.
    pub fn try_acquire(&self, action_type: &str, max_per_window: u32) -> bool {
        self.try_acquire_at(action_type, max_per_window, Instant::now())
    }

    /// Same as `try_acquire` with an explicit clock reading.
    pub fn try_acquire_at(&self, action_type: &str, max_per_window: u32, now: Instant) -> bool {
        if max_per_window == 0 {
            return false;
        }
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match windows.get_mut(action_type) {
            Some(w) if now.saturating_duration_since(w.started) < self.window => {
                if w.count < max_per_window {
                    w.count += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                windows.insert(
                    action_type.to_string(),
                    Window {
                        count: 1,
                        started: now,
                    },
                );
                true
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
