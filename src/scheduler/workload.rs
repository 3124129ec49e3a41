//! Shared workload state and admission throttling
//!
//! Both schedulers of a pipeline hold the same [`SchedulerState`]: the lock
//! manager plus one in-flight counter per stage. Admission into a stage goes
//! through an [`AdmissionGate`], which pauses (never rejects) while the
//! relevant backlog exceeds the configured limit.

use crate::unpack::UnpackingLockManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Pause mechanism used while throttled
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Atomically updated in-flight task count
#[derive(Debug, Default)]
pub struct WorkloadCounter {
    in_flight: AtomicUsize,
}

impl WorkloadCounter {
    pub fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn get(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Hold one already-counted task; the count drops when the slot does, unwinding included
    pub fn slot(&self) -> InFlightSlot<'_> {
        InFlightSlot(self)
    }
}

#[must_use]
pub struct InFlightSlot<'a>(&'a WorkloadCounter);

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// State shared by handle between the schedulers and workers of one pipeline
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub locks: Arc<UnpackingLockManager>,
    pub unpacking: WorkloadCounter,
    pub analysis: WorkloadCounter,
}

impl SchedulerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn combined_backlog(&self) -> usize {
        self.unpacking.get() + self.analysis.get()
    }

    pub fn is_idle(&self) -> bool {
        self.combined_backlog() == 0
    }
}

/// True when throttling is enabled and `backlog` is above `limit`
pub fn throttle_exceeded(limit: i64, backlog: usize) -> bool {
    limit >= 0 && backlog as u64 > limit as u64
}

/// Delays admission while a backlog is above its limit
pub struct AdmissionGate {
    limit: i64,
    pause: Duration,
    throttled: AtomicBool,
    sleeper: Arc<dyn Sleeper>,
}

impl AdmissionGate {
    pub fn new(limit: i64, pause: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            limit,
            pause,
            throttled: AtomicBool::new(false),
            sleeper,
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn is_enabled(&self) -> bool {
        self.limit >= 0
    }

    /// Current throttle indicator
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    /// Recompute the indicator from `backlog` and return it
    pub fn refresh(&self, backlog: usize) -> bool {
        let exceeded = throttle_exceeded(self.limit, backlog);
        let was = self.throttled.swap(exceeded, Ordering::SeqCst);
        if exceeded && !was {
            tracing::info!(backlog, limit = self.limit, "throttling admission");
        } else if !exceeded && was {
            tracing::info!(backlog, "backlog receded, resuming admission");
        }
        exceeded
    }

    /// Sleep in `pause` steps until `backlog()` drops to the limit or `stop` is raised
    ///
    /// Returns how many pauses were taken.
    pub fn wait_for_capacity(&self, backlog: impl Fn() -> usize, stop: &AtomicBool) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let mut pauses = 0;
        while self.refresh(backlog()) && !stop.load(Ordering::Relaxed) {
            self.sleeper.sleep(self.pause);
            pauses += 1;
        }
        pauses
    }

    /// One monitor tick: refresh from `backlog` and sleep once if throttled
    pub fn monitor_tick(&self, backlog: usize) -> bool {
        let throttled = self.refresh(backlog);
        if throttled {
            self.sleeper.sleep(self.pause);
        }
        throttled
    }
}
