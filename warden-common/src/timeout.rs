// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Tracks a single bounded wait: how long it may last and how much of it is left.
///
/// Every blocking step of a shutdown (waiting for a child to exit, waiting for the crash
/// collector to report back) gets its own manager so that no step can wait forever.
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    // 4ms per sched slice, give ~4x10 slices for safety
    pub const MINIMUM_REAP_TIME: Duration = Duration::from_millis(160);
    /// Granularity used when polling for a state change that has no blocking primitive.
    pub const POLL_SLICE: Duration = Duration::from_millis(5);

    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start_time.elapsed())
    }

    /// Like [`TimeoutManager::remaining`], but never below [`Self::MINIMUM_REAP_TIME`].
    /// Used for the last wait after a forceful kill, where giving up early would leak a zombie.
    pub fn remaining_for_reap(&self) -> Duration {
        self.remaining().max(Self::MINIMUM_REAP_TIME)
    }

    /// Remaining time as a `poll(2)` timeout argument.
    pub fn remaining_ms(&self) -> i32 {
        self.remaining().as_millis().min(i32::MAX as u128) as i32
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sleeps for one poll slice, or less if the deadline is closer than that.
    pub fn sleep_slice(&self) {
        let nap = self.remaining().min(Self::POLL_SLICE);
        if !nap.is_zero() {
            std::thread::sleep(nap);
        }
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("start_time", &self.start_time)
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}
