//! Tracks the last time each metric series was updated, so expired series
//! can be found and removed from the registry. A metric configured without
//! an `expiration` is never tracked (constant memory regardless of series
//! cardinality for always-on metrics).

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// `metric_name -> { sorted label values -> last update instant }`.
pub struct MetricsLastSeen {
    expirations: HashMap<String, u64>,
    last_seen: HashMap<String, HashMap<Vec<String>, Instant>>,
}

impl MetricsLastSeen {
    pub fn new(expirations: HashMap<String, u64>) -> Self {
        Self {
            expirations,
            last_seen: HashMap::new(),
        }
    }

    /// Record that `name`'s series keyed by `label_values` (already sorted
    /// by label name, matching [`shared::model::MetricResult::label_values`])
    /// was updated at `now`. A no-op for metrics without a configured
    /// expiration.
    pub fn update(&mut self, name: &str, label_values: Vec<String>, now: Instant) {
        if !self.expirations.contains_key(name) {
            return;
        }
        self.last_seen
            .entry(name.to_string())
            .or_default()
            .insert(label_values, now);
    }

    /// Find and remove all series that haven't been updated for strictly
    /// more than their metric's configured expiration, as of `now`.
    /// Returns `metric_name -> [sorted label values]` for every expired
    /// series.
    pub fn expire_series(&mut self, now: Instant) -> HashMap<String, Vec<Vec<String>>> {
        let mut expired: HashMap<String, Vec<Vec<String>>> = HashMap::new();

        for (name, series) in self.last_seen.iter_mut() {
            let expiration = Duration::from_secs(self.expirations[name]);
            let dead: Vec<Vec<String>> = series
                .iter()
                .filter(|(_, &last)| now.saturating_duration_since(last) > expiration)
                .map(|(labels, _)| labels.clone())
                .collect();
            if !dead.is_empty() {
                expired.insert(name.clone(), dead);
            }
        }

        for (name, label_sets) in &expired {
            if let Some(series) = self.last_seen.get_mut(name) {
                for labels in label_sets {
                    series.remove(labels);
                }
                if series.is_empty() {
                    self.last_seen.remove(name);
                }
            }
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_metric_without_expiration_is_ignored() {
        let mut tracker = MetricsLastSeen::new(HashMap::new());
        tracker.update("m", vec!["foo".to_string()], Instant::now());
        assert!(tracker.expire_series(Instant::now()).is_empty());
    }

    #[test]
    fn expires_series_past_their_expiration() {
        let mut expirations = HashMap::new();
        expirations.insert("m".to_string(), 10);
        let mut tracker = MetricsLastSeen::new(expirations);

        let t0 = Instant::now();
        tracker.update("m", vec!["foo".to_string()], t0);

        let t1 = t0 + Duration::from_secs(5);
        tracker.update("m", vec!["bar".to_string()], t1);

        let t2 = t0 + Duration::from_secs(20);
        let expired = tracker.expire_series(t2);
        assert_eq!(expired.get("m").unwrap(), &vec![vec!["foo".to_string()]]);

        // bar is still within its expiration window relative to t1.
        let remaining = tracker.expire_series(t1 + Duration::from_secs(5));
        assert!(remaining.is_empty());
    }
}
