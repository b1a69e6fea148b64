//! Process lifecycle state for the bridge
//!
//! Tracks start time, last user-visible activity, and the shutdown flag.
//! The HTTP facade records activity, the signal handler begins shutdown,
//! and the status endpoint reads both.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Process-wide lifecycle tracker, shared by handle
#[derive(Debug)]
pub struct Lifecycle {
    started_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    shutting_down: AtomicBool,
}

impl Lifecycle {
    /// Create a tracker; last activity starts at process start
    pub fn new() -> Self {
        let now = Utc::now();
        Lifecycle {
            started_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Record user-visible activity
    pub fn record_activity(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Timestamp of the most recent user-visible activity
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or(self.started_at)
    }

    /// Seconds since process start
    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Flip the shutdown flag; returns true only for the first caller
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
