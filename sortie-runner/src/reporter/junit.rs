// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Reporter;
use crate::{errors::ReportWriteError, harness::TestOutcome};
use camino::Utf8Path;
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use sortie_metadata::Verdict;
use std::{fs::File, sync::Mutex};

/// File name of the JUnit report.
pub const JUNIT_FILE_NAME: &str = "junit.xml";

/// Writes a JUnit XML report, with one test suite per top-level test.
#[derive(Debug)]
pub struct JunitReporter {
    report_name: String,
    test_suites: Mutex<DebugIgnore<IndexMap<String, TestSuite>>>,
}

impl JunitReporter {
    /// Creates a new reporter. `report_name` names the top-level `testsuites` element.
    pub fn new(report_name: impl Into<String>) -> Self {
        Self {
            report_name: report_name.into(),
            test_suites: Mutex::new(DebugIgnore(IndexMap::new())),
        }
    }
}

impl Reporter for JunitReporter {
    fn report_test(&self, outcome: &TestOutcome) {
        let suite_name = outcome
            .name
            .split_once('/')
            .map_or(outcome.name.as_str(), |(top, _)| top)
            .to_owned();

        let status = match outcome.verdict {
            Verdict::Pass => TestCaseStatus::success(),
            Verdict::Skip => TestCaseStatus::skipped(),
            Verdict::Fail | Verdict::Warn => {
                let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                if outcome.timed_out {
                    status.set_type("timeout");
                } else if outcome.verdict == Verdict::Warn {
                    status.set_type("warn");
                }
                status
            }
        };
        let mut testcase = TestCase::new(outcome.name.as_str(), status);
        testcase
            .set_classname(suite_name.as_str())
            .set_time(outcome.duration);
        if !outcome.output.is_empty() {
            testcase.set_system_out(outcome.output.as_str());
        }

        let mut suites = self
            .test_suites
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        suites
            .entry(suite_name.clone())
            .or_insert_with(|| TestSuite::new(suite_name))
            .add_test_case(testcase);
    }

    fn set_result(&self, _verdict: Verdict) {}

    fn output(&self, dir: &Utf8Path) -> Result<(), ReportWriteError> {
        let suites = std::mem::take(
            &mut *self
                .test_suites
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut report = Report::new(self.report_name.as_str());
        report.add_test_suites(suites.0.into_values());

        let path = dir.join(JUNIT_FILE_NAME);
        let f = File::create(&path).map_err(|error| ReportWriteError::Fs {
            file: path.clone(),
            error,
        })?;
        report
            .serialize(f)
            .map_err(|error| ReportWriteError::Junit { file: path, error })
    }
}
