//! Sync scheduling
//!
//! Decides when the next automatic cycle is due. After a successful cycle the
//! next one runs one interval later; after a transient failure the delay
//! grows exponentially from the initial backoff, capped at the maximum.
//! The scheduler only computes deadlines; the sync service sleeps on them.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SyncConfig;

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Interval timer or retry backoff
    Timer,
    /// Connectivity came back
    Reconnect,
    /// Explicit request from the caller
    Manual,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncTrigger::Timer => "timer",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncScheduler {
    enabled: bool,
    interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    consecutive_failures: u32,
    next_due: Option<Instant>,
}

impl SyncScheduler {
    pub fn new(config: &SyncConfig, now: Instant) -> Self {
        let mut scheduler = Self {
            enabled: config.auto_sync_enabled,
            interval: config.sync_interval(),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            consecutive_failures: 0,
            next_due: None,
        };
        scheduler.schedule(now + scheduler.interval);
        scheduler
    }

    /// Pick up new settings; the timer restarts from `now`
    pub fn configure(&mut self, config: &SyncConfig, now: Instant) {
        self.enabled = config.auto_sync_enabled;
        self.interval = config.sync_interval();
        self.initial_backoff = config.initial_backoff();
        self.max_backoff = config.max_backoff();
        let delay = self.current_delay();
        self.schedule(now + delay);
    }

    /// Deadline of the next automatic cycle (`None` when auto sync is off)
    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due.is_some_and(|due| now >= due)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before retrying after the current run of failures
    pub fn backoff_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (self.consecutive_failures - 1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// A cycle completed; the next one is one interval away
    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.schedule(now + self.interval);
    }

    /// A cycle hit a transient failure; returns the retry delay
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.backoff_delay();
        self.schedule(now + delay);
        delay
    }

    /// The timer fired but no cycle could run (offline); try again later
    pub fn skip(&mut self, now: Instant) {
        self.schedule(now + self.interval);
    }

    fn current_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            self.interval
        } else {
            self.backoff_delay()
        }
    }

    fn schedule(&mut self, due: Instant) {
        self.next_due = self.enabled.then_some(due);
    }
}
