//! In-memory recent-error tracking. Each penalizing upstream error shrinks
//! a provider's effective weight for the next sixty seconds; entries age
//! out on every read so callers always observe a compacted window.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Sliding window over which errors keep penalizing a provider.
pub const ERROR_WINDOW_MS: u64 = 60_000;

const PENALTY_RATE_LIMITED: f64 = 5.0;
const PENALTY_SERVER_ERROR: f64 = 3.0;

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEvent {
    pub ts_ms: u64,
    pub status: u16,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub recent_error_count: usize,
    pub window_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<HealthEvent>,
}

fn penalizes(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn penalty_factor(status: u16) -> f64 {
    if status == 429 {
        PENALTY_RATE_LIMITED
    } else {
        PENALTY_SERVER_ERROR
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-provider deques of `(timestamp, status)` events. Process-local and
/// never persisted; a restart forgets all penalties.
#[derive(Debug, Default)]
pub struct HealthTracker {
    events: HashMap<String, VecDeque<HealthEvent>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&mut self, provider: &str, status: u16) {
        self.record_error_at(provider, status, now_millis());
    }

    pub fn record_error_at(&mut self, provider: &str, status: u16, now_ms: u64) {
        if !penalizes(status) {
            return;
        }
        let deque = self.events.entry(provider.to_string()).or_default();
        deque.push_back(HealthEvent {
            ts_ms: now_ms,
            status,
        });
        Self::compact(deque, now_ms);
    }

    /// Effective weight for a provider given its positional base weight.
    pub fn weight(&mut self, provider: &str, base: f64) -> f64 {
        self.weight_at(provider, base, now_millis())
    }

    pub fn weight_at(&mut self, provider: &str, base: f64, now_ms: u64) -> f64 {
        let Some(deque) = self.events.get_mut(provider) else {
            return base;
        };
        Self::compact(deque, now_ms);
        if deque.is_empty() {
            return base;
        }
        let penalty: f64 = deque
            .iter()
            .map(|event| penalty_factor(event.status))
            .product();
        base / penalty
    }

    pub fn stats(&mut self, provider: &str) -> HealthStats {
        self.stats_at(provider, now_millis())
    }

    pub fn stats_at(&mut self, provider: &str, now_ms: u64) -> HealthStats {
        let Some(deque) = self.events.get_mut(provider) else {
            return HealthStats {
                recent_error_count: 0,
                window_ms: ERROR_WINDOW_MS,
                last_error: None,
            };
        };
        Self::compact(deque, now_ms);
        HealthStats {
            recent_error_count: deque.len(),
            window_ms: ERROR_WINDOW_MS,
            last_error: deque.back().copied(),
        }
    }

    pub fn reset(&mut self, provider: &str) {
        self.events.remove(provider);
    }

    pub fn reset_all(&mut self) {
        self.events.clear();
    }

    fn compact(deque: &mut VecDeque<HealthEvent>, now_ms: u64) {
        while let Some(front) = deque.front() {
            if now_ms.saturating_sub(front.ts_ms) < ERROR_WINDOW_MS {
                break;
            }
            deque.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_provider_keeps_base_weight() {
        let mut tracker = HealthTracker::new();
        assert_eq!(tracker.weight_at("p", 1000.0, 1_000), 1000.0);
    }

    #[test]
    fn rate_limit_and_server_errors_multiply_penalties() {
        let mut tracker = HealthTracker::new();
        tracker.record_error_at("p", 429, 1_000);
        tracker.record_error_at("p", 503, 2_000);
        // 1000 / (5 * 3)
        let weight = tracker.weight_at("p", 1000.0, 3_000);
        assert!((weight - 1000.0 / 15.0).abs() < 1e-9);
    }

    #[test]
    fn two_rate_limits_divide_by_twenty_five() {
        let mut tracker = HealthTracker::new();
        tracker.record_error_at("p", 429, 1_000);
        tracker.record_error_at("p", 429, 1_000);
        assert_eq!(tracker.weight_at("p", 1000.0, 2_000), 40.0);
    }

    #[test]
    fn non_penalizing_statuses_are_ignored() {
        let mut tracker = HealthTracker::new();
        tracker.record_error_at("p", 404, 1_000);
        tracker.record_error_at("p", 302, 1_000);
        tracker.record_error_at("p", 0, 1_000);
        assert_eq!(tracker.weight_at("p", 900.0, 1_500), 900.0);
        assert_eq!(tracker.stats_at("p", 1_500).recent_error_count, 0);
    }

    #[test]
    fn events_expire_after_the_window() {
        let mut tracker = HealthTracker::new();
        tracker.record_error_at("p", 429, 1_000);
        assert!(tracker.weight_at("p", 1000.0, 1_000 + ERROR_WINDOW_MS - 1) < 1000.0);
        assert_eq!(
            tracker.weight_at("p", 1000.0, 1_000 + ERROR_WINDOW_MS),
            1000.0
        );
    }

    #[test]
    fn stats_report_count_window_and_last_event() {
        let mut tracker = HealthTracker::new();
        tracker.record_error_at("p", 500, 1_000);
        tracker.record_error_at("p", 429, 2_000);

        let stats = tracker.stats_at("p", 2_500);
        assert_eq!(stats.recent_error_count, 2);
        assert_eq!(stats.window_ms, ERROR_WINDOW_MS);
        let last = stats.last_error.expect("last event");
        assert_eq!(last.status, 429);
        assert_eq!(last.ts_ms, 2_000);
    }

    #[test]
    fn reset_clears_one_provider_only() {
        let mut tracker = HealthTracker::new();
        tracker.record_error_at("a", 429, 1_000);
        tracker.record_error_at("b", 429, 1_000);
        tracker.reset("a");
        assert_eq!(tracker.weight_at("a", 1000.0, 1_100), 1000.0);
        assert!(tracker.weight_at("b", 1000.0, 1_100) < 1000.0);

        tracker.reset_all();
        assert_eq!(tracker.weight_at("b", 1000.0, 1_200), 1000.0);
    }
}
