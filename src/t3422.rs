//! T3422 Guard Timer
//!
//! Retransmission guard for a network initiated DETACH REQUEST. The
//! scheduler owns the per-attempt retransmission record for as long as the
//! timer is pending; the EMM context only holds an opaque handle. Stopping
//! a timer returns the record to the caller, so the accumulated
//! retransmission count survives a stop-and-restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::context::UeId;
use crate::detach::NwDetachType;

/// Maximum number of DETACH REQUEST transmissions before the detach falls
/// back to the implicit path
pub const DETACH_REQ_COUNTER_MAX: u32 = 5;

/// Opaque handle to a pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Retransmission record carried across T3422 fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NwDetachData {
    /// UE identifier
    pub ue_id: UeId,
    /// Number of expiries seen so far
    pub retransmission_count: u32,
    /// Network initiated detach type of the pending procedure
    pub detach_type: NwDetachType,
}

impl NwDetachData {
    /// Fresh record for a first transmission
    pub fn new(ue_id: UeId, detach_type: NwDetachType) -> Self {
        Self {
            ue_id,
            retransmission_count: 0,
            detach_type,
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    data: NwDetachData,
}

/// Deterministic one-shot timer scheduler for the NAS task
///
/// Handlers are not run by the scheduler itself; the owning task drains
/// expired records with [`TimerScheduler::pop_expired`] at its next
/// scheduling point and invokes the expiry path.
#[derive(Default)]
pub struct TimerScheduler {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, TimerEntry>>,
}

impl TimerScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start a one-shot timer with second/microsecond granularity
    pub fn start(&self, sec: u64, usec: u64, data: NwDetachData) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(sec) + Duration::from_micros(usec);
        self.entries
            .lock()
            .unwrap()
            .insert(id, TimerEntry { deadline, data });
        TimerHandle(id)
    }

    /// Stop a pending timer, reclaiming its record
    ///
    /// Stopping a timer that is not running is a no-op and returns `None`.
    pub fn stop(&self, handle: TimerHandle) -> Option<NwDetachData> {
        self.entries
            .lock()
            .unwrap()
            .remove(&handle.0)
            .map(|e| e.data)
    }

    /// Check whether a timer is still pending
    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.entries.lock().unwrap().contains_key(&handle.0)
    }

    /// Peek at the record of a pending timer
    pub fn data(&self, handle: TimerHandle) -> Option<NwDetachData> {
        self.entries.lock().unwrap().get(&handle.0).map(|e| e.data)
    }

    /// Remove and return all records whose deadline has passed
    pub fn pop_expired(&self) -> Vec<NwDetachData> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|e| e.data))
            .collect()
    }

    /// Number of pending timers
    pub fn active_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_stop_reclaims_data() {
        let sched = TimerScheduler::new();
        let data = NwDetachData::new(1, NwDetachType::NoReattach);
        let h = sched.start(6, 0, data);
        assert!(sched.is_active(h));
        assert_eq!(sched.active_count(), 1);

        let reclaimed = sched.stop(h).unwrap();
        assert_eq!(reclaimed, data);
        assert!(!sched.is_active(h));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let sched = TimerScheduler::new();
        let h = sched.start(6, 0, NwDetachData::new(1, NwDetachType::Reattach));
        assert!(sched.stop(h).is_some());
        assert!(sched.stop(h).is_none());
    }

    #[test]
    fn test_count_survives_restart() {
        let sched = TimerScheduler::new();
        let mut data = NwDetachData::new(1, NwDetachType::NoReattach);
        data.retransmission_count = 3;
        let h = sched.start(6, 0, data);

        let carried = sched.stop(h).unwrap();
        let h2 = sched.start(6, 0, carried);
        assert_eq!(sched.data(h2).unwrap().retransmission_count, 3);
    }

    #[test]
    fn test_pop_expired_returns_due_records() {
        let sched = TimerScheduler::new();
        let due = NwDetachData::new(1, NwDetachType::NoReattach);
        let pending = NwDetachData::new(2, NwDetachType::Reattach);
        sched.start(0, 0, due);
        let h = sched.start(3600, 0, pending);

        let fired = sched.pop_expired();
        assert_eq!(fired, vec![due]);
        assert!(sched.is_active(h));
        assert_eq!(sched.active_count(), 1);
    }

    #[test]
    fn test_pop_expired_empty() {
        let sched = TimerScheduler::new();
        assert!(sched.pop_expired().is_empty());
    }
}
