// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

/// Limits how many test nodes execute at once.
///
/// `running` counts nodes that hold a slot, and `waiting` counts parallel nodes blocked on one.
/// The root node holds a slot from the start, and releases it once the whole tree finishes.
#[derive(Debug)]
pub(crate) struct ParallelGate {
    counters: Mutex<GateCounters>,
    // Permits are only ever handed directly from a releasing node to one waiter.
    wakeups: Semaphore,
}

/// A snapshot of the gate's counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GateCounters {
    /// Nodes currently holding a slot.
    pub running: usize,
    /// Parallel nodes waiting for a slot.
    pub waiting: usize,
    /// The maximum number of nodes that may hold a slot at once.
    pub max_parallel: usize,
}

impl ParallelGate {
    pub(crate) fn new(max_parallel: usize) -> Self {
        Self {
            counters: Mutex::new(GateCounters {
                running: 1,
                waiting: 0,
                max_parallel: max_parallel.max(1),
            }),
            wakeups: Semaphore::new(0),
        }
    }

    /// Waits until a slot is available, then takes it.
    pub(crate) async fn wait_parallel(&self) {
        {
            let mut counters = self.lock();
            if counters.running < counters.max_parallel {
                counters.running += 1;
                return;
            }
            counters.waiting += 1;
        }

        // The releasing node has already transferred its slot to us.
        match self.wakeups.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => debug!("parallel gate closed while waiting"),
        }
    }

    /// Gives up a slot, handing it to a waiter if there is one.
    pub(crate) fn release(&self) {
        let mut counters = self.lock();
        if counters.waiting == 0 {
            counters.running = counters.running.saturating_sub(1);
            return;
        }
        counters.waiting -= 1;
        self.wakeups.add_permits(1);
    }

    pub(crate) fn counters(&self) -> GateCounters {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateCounters> {
        // A poisoned lock only means another node panicked while holding it, and the counters
        // are still consistent.
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
