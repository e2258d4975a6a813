// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Machine-readable reports of a suite's results.
//!
//! Reporters are notified as each node finishes, then asked to write their output once the
//! suite is done.

mod json;
mod junit;

pub use json::{JSON_REPORT_FILE_NAME, JsonReporter, read_report};
pub use junit::{JUNIT_FILE_NAME, JunitReporter};

use crate::{errors::ReportWriteError, harness::TestOutcome};
use camino::Utf8Path;
use sortie_metadata::Verdict;
use std::{fmt, sync::Arc};

/// Receives test outcomes and writes a report.
pub trait Reporter: Send + Sync {
    /// Records the outcome of a node.
    fn report_test(&self, outcome: &TestOutcome);

    /// Records the overall result of the suite.
    fn set_result(&self, verdict: Verdict);

    /// Writes the report into `dir`.
    fn output(&self, dir: &Utf8Path) -> Result<(), ReportWriteError>;
}

/// A set of reporters that are all notified together.
#[derive(Clone, Default)]
pub struct Reporters {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl Reporters {
    /// Creates an empty set of reporters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reporter to the set.
    pub fn push(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    /// Returns true if there are no reporters.
    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    pub(crate) fn report_test(&self, outcome: &TestOutcome) {
        for r in &self.reporters {
            r.report_test(outcome);
        }
    }

    pub(crate) fn set_result(&self, verdict: Verdict) {
        for r in &self.reporters {
            r.set_result(verdict);
        }
    }

    /// Writes every report, stopping at the first error.
    pub(crate) fn output(&self, dir: &Utf8Path) -> Result<(), ReportWriteError> {
        self.reporters.iter().try_for_each(|r| r.output(dir))
    }
}

impl fmt::Debug for Reporters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporters")
            .field("len", &self.reporters.len())
            .finish()
    }
}
