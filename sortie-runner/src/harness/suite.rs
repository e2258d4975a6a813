// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    HarnessFn, TestResult,
    gate::{GateCounters, ParallelGate},
    names::NameUniquifier,
    node::{H, TimerStart, run_node},
};
use crate::{errors::SuiteError, reporter::Reporters};
use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use sortie_metadata::Verdict;
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use swrite::{SWrite, swrite};
use tracing::{debug, info};

/// Name of the TAP file written to the output directory.
pub const TAP_FILE_NAME: &str = "test.tap";

/// Name of the reports directory under the output directory.
pub const REPORTS_DIR_NAME: &str = "reports";

/// Options for a [`Suite`].
#[derive(Clone, Debug)]
pub struct SuiteOptions {
    /// Directory for test artifacts. Cleaned before the suite runs.
    pub output_dir: Utf8PathBuf,
    /// Maximum number of parallel nodes running at once.
    pub parallel: usize,
    /// How long a timed-out body gets to return before it is abandoned.
    pub timeout_grace: Duration,
    /// Reporters notified as nodes finish.
    pub reporters: Reporters,
}

impl SuiteOptions {
    /// Creates options with a single parallel slot and no reporters.
    pub fn new(output_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            parallel: 1,
            timeout_grace: Duration::from_secs(60),
            reporters: Reporters::default(),
        }
    }
}

/// A top-level test in a suite.
pub struct SuiteTest {
    name: String,
    timeout: Option<Duration>,
    timer_start: TimerStart,
    f: HarnessFn,
}

impl SuiteTest {
    /// Creates a test without a deadline.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: None,
            timer_start: TimerStart::Immediate,
            f: Box::new(move |h| f(h).boxed()),
        }
    }

    /// Sets the test's deadline, and when it starts counting down.
    pub fn with_timeout(mut self, timeout: Option<Duration>, timer_start: TimerStart) -> Self {
        self.timeout = timeout;
        self.timer_start = timer_start;
        self
    }

    /// The name of the test.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The final state of a node.
#[derive(Clone, Debug)]
pub struct TestOutcome {
    /// The full name of the node.
    pub name: String,
    /// The depth of the node. Top-level tests are at level 1.
    pub level: usize,
    /// The node's verdict.
    pub verdict: Verdict,
    /// How long the node's body ran.
    pub duration: Duration,
    /// Everything the node logged.
    pub output: String,
    /// Subtest names recorded by the node.
    pub subtests: Vec<String>,
    /// Whether a bucket member started running under this node.
    pub non_exclusive_test_started: bool,
    /// Whether the node exceeded its deadline.
    pub timed_out: bool,
}

impl TestOutcome {
    /// Returns true if the node failed, including failures downgraded to warnings.
    pub fn failed(&self) -> bool {
        matches!(self.verdict, Verdict::Fail | Verdict::Warn)
    }
}

/// The result of running a suite.
#[derive(Debug)]
pub struct SuiteSummary {
    /// Every node except the root, in completion order.
    pub outcomes: Vec<TestOutcome>,
    /// True if any node failed.
    pub failed: bool,
    /// True if any test ran at all.
    pub ran: bool,
    /// The gate's counters after the root released its slot.
    pub counters: GateCounters,
}

impl SuiteSummary {
    /// Outcomes of top-level tests only.
    pub fn top_level(&self) -> impl Iterator<Item = &TestOutcome> + '_ {
        self.outcomes.iter().filter(|o| o.level == 1)
    }
}

/// State shared by every node in a suite.
pub(crate) struct SuiteShared {
    gate: ParallelGate,
    names: Mutex<NameUniquifier>,
    output_dir: Utf8PathBuf,
    timeout_grace: Duration,
    reporters: Reporters,
    outcomes: Mutex<Vec<TestOutcome>>,
}

impl SuiteShared {
    pub(super) fn unique_name(&self, parent: Option<&str>, subname: &str) -> String {
        lock(&self.names).unique(parent, subname)
    }

    pub(super) fn gate(&self) -> &ParallelGate {
        &self.gate
    }

    pub(super) fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    pub(super) fn timeout_grace(&self) -> Duration {
        self.timeout_grace
    }

    pub(super) fn record(&self, outcome: TestOutcome) {
        let secs = outcome.duration.as_secs_f64();
        if outcome.level == 1 {
            info!("--- {}: {} ({secs:.2}s)", outcome.verdict, outcome.name);
        } else {
            debug!("--- {}: {} ({secs:.2}s)", outcome.verdict, outcome.name);
        }
        if outcome.verdict.is_failure() && !outcome.output.is_empty() {
            for line in outcome.output.lines() {
                info!("        {line}");
            }
        }
        self.reporters.report_test(&outcome);
        lock(&self.outcomes).push(outcome);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A set of top-level tests run together under one root node.
pub struct Suite {
    options: SuiteOptions,
    tests: Vec<SuiteTest>,
}

impl Suite {
    /// Creates a new, empty suite.
    pub fn new(options: SuiteOptions) -> Self {
        Self {
            options,
            tests: Vec::new(),
        }
    }

    /// Adds a top-level test. All top-level tests run in parallel.
    pub fn add_test(&mut self, test: SuiteTest) {
        self.tests.push(test);
    }

    /// Runs every test and writes the TAP file and reports.
    pub async fn run(self) -> Result<SuiteSummary, SuiteError> {
        let Suite { options, tests } = self;
        clean_output_dir(&options.output_dir)?;
        let reports_dir = options.output_dir.join(REPORTS_DIR_NAME);
        std::fs::create_dir_all(&reports_dir).map_err(|err| SuiteError::CreateOutputDir {
            path: reports_dir.clone(),
            err,
        })?;

        let shared = Arc::new(SuiteShared {
            gate: ParallelGate::new(options.parallel),
            names: Mutex::new(NameUniquifier::default()),
            output_dir: options.output_dir.clone(),
            timeout_grace: options.timeout_grace,
            reporters: options.reporters.clone(),
            outcomes: Mutex::new(Vec::new()),
        });

        let (root, run) = H::root(shared.clone());
        let body: HarnessFn = Box::new(move |h: H| {
            async move {
                for test in tests {
                    h.register_parallel(&test.name, test.timeout, test.timer_start, test.f);
                }
                Ok(())
            }
            .boxed()
        });
        run_node(root.clone(), body, run, false).await;
        shared.gate().release();

        let outcomes = std::mem::take(&mut *lock(&shared.outcomes));
        let summary = SuiteSummary {
            failed: root.failed(),
            ran: !outcomes.is_empty(),
            counters: shared.gate().counters(),
            outcomes,
        };

        let tap_path = options.output_dir.join(TAP_FILE_NAME);
        std::fs::write(&tap_path, tap_output(&summary))
            .map_err(|err| SuiteError::WriteTap { path: tap_path, err })?;

        let reporters = &options.reporters;
        reporters.set_result(if summary.failed {
            Verdict::Fail
        } else {
            Verdict::Pass
        });
        reporters.output(&reports_dir)?;

        Ok(summary)
    }
}

fn clean_output_dir(dir: &Utf8Path) -> Result<(), SuiteError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(SuiteError::CleanOutputDir {
                path: dir.to_owned(),
                err,
            });
        }
    }
    std::fs::create_dir_all(dir).map_err(|err| SuiteError::CreateOutputDir {
        path: dir.to_owned(),
        err,
    })
}

fn tap_output(summary: &SuiteSummary) -> String {
    let top_level: Vec<_> = summary.top_level().collect();
    let mut out = String::new();
    swrite!(out, "1..{}\n", top_level.len());
    for (i, outcome) in top_level.iter().enumerate() {
        let n = i + 1;
        match outcome.verdict {
            Verdict::Fail => swrite!(out, "not ok {n} - {}\n", outcome.name),
            Verdict::Skip => swrite!(out, "ok {n} - {} # SKIP\n", outcome.name),
            Verdict::Warn => swrite!(out, "ok {n} - {} # WARN\n", outcome.name),
            Verdict::Pass => swrite!(out, "ok {n} - {}\n", outcome.name),
        }
    }
    out
}
