//! Detach Procedure Counters
//!
//! Counter sink consumed by the detach procedure. The metric backend
//! (export, aggregation) is external; the core only names counters and
//! label pairs.

/// Counter name for every detach outcome
pub const UE_DETACH: &str = "ue_detach";

/// Sink for monotonically increasing counters
pub trait CounterSink: Send + Sync {
    /// Increment `name` by `delta` under the given label pairs
    fn increment(&self, name: &str, delta: u64, labels: &[(&str, &str)]);
}

/// Sink that records increments on the log facade
#[derive(Debug, Default)]
pub struct LogCounterSink;

impl CounterSink for LogCounterSink {
    fn increment(&self, name: &str, delta: u64, labels: &[(&str, &str)]) {
        log::debug!("counter {name} +{delta} {labels:?}");
    }
}

/// Sink that records every increment, for assertions in tests
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    /// Recorded (name, delta, labels) tuples
    pub counts: std::sync::Mutex<Vec<(String, u64, Vec<(String, String)>)>>,
}

#[cfg(test)]
impl RecordingSink {
    /// Number of increments matching the counter name and every given label
    pub fn count(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counts
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _, ls)| {
                n == name
                    && labels
                        .iter()
                        .all(|(k, v)| ls.iter().any(|(lk, lv)| lk == k && lv == v))
            })
            .map(|(_, delta, _)| *delta)
            .sum()
    }
}

#[cfg(test)]
impl CounterSink for RecordingSink {
    fn increment(&self, name: &str, delta: u64, labels: &[(&str, &str)]) {
        self.counts.lock().unwrap().push((
            name.to_string(),
            delta,
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sink_accepts_increments() {
        let sink = LogCounterSink;
        sink.increment(UE_DETACH, 1, &[("result", "success")]);
    }

    #[test]
    fn test_recording_sink_filters_by_labels() {
        let sink = RecordingSink::default();
        sink.increment(UE_DETACH, 1, &[("result", "success")]);
        sink.increment(UE_DETACH, 1, &[("result", "success")]);
        sink.increment(
            UE_DETACH,
            1,
            &[("result", "failure"), ("cause", "no_emm_context")],
        );
        assert_eq!(sink.count(UE_DETACH, &[("result", "success")]), 2);
        assert_eq!(sink.count(UE_DETACH, &[("cause", "no_emm_context")]), 1);
        assert_eq!(sink.count(UE_DETACH, &[("result", "unknown")]), 0);
    }
}
