// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use pin_project_lite::pin_project;
use std::{future::Future, pin::Pin, task::Poll, time::Duration};
use tokio::time::{Instant, Sleep};

/// Creates a deadline that only counts down while it is running.
///
/// Test deadlines are built on this: the exec timer of a test node pauses and resumes the
/// deadline, so that time spent provisioning machines doesn't count against the test's budget.
pub(crate) fn pausable_sleep(duration: Duration) -> PausableSleep {
    PausableSleep::new(duration)
}

pin_project! {
    /// A wrapper around `tokio::time::Sleep` that can also be paused and resumed.
    #[derive(Debug)]
    pub(crate) struct PausableSleep {
        #[pin]
        sleep: Sleep,
        pause_state: SleepPauseState,
    }
}

impl PausableSleep {
    fn new(duration: Duration) -> Self {
        Self {
            sleep: tokio::time::sleep(duration),
            pause_state: SleepPauseState::Running,
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        matches!(self.pause_state, SleepPauseState::Paused { .. })
    }

    /// Pauses the deadline. Does nothing if it is already paused.
    pub(crate) fn pause(self: Pin<&mut Self>) {
        let this = self.project();
        if let SleepPauseState::Running = &*this.pause_state {
            let deadline = this.sleep.deadline();
            this.sleep.reset(far_future());
            // Zero if the deadline has already passed, in which case resume fires immediately.
            let remaining = deadline.saturating_duration_since(Instant::now());
            *this.pause_state = SleepPauseState::Paused { remaining };
        }
    }

    /// Resumes the deadline. Does nothing if it is already running.
    pub(crate) fn resume(self: Pin<&mut Self>) {
        let this = self.project();
        if let SleepPauseState::Paused { remaining } = &*this.pause_state {
            this.sleep
                .reset(Instant::now().checked_add(*remaining).unwrap_or_else(far_future));
            *this.pause_state = SleepPauseState::Running;
        }
    }
}

impl Future for PausableSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match &this.pause_state {
            SleepPauseState::Running => this.sleep.poll(cx),
            SleepPauseState::Paused { .. } => Poll::Pending,
        }
    }
}

#[derive(Debug)]
enum SleepPauseState {
    Running,
    Paused { remaining: Duration },
}

// Cribbed from tokio.
fn far_future() -> Instant {
    // Roughly 30 years from now.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}
