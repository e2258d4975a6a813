// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Reporter;
use crate::{
    errors::{ReportReadError, ReportWriteError},
    harness::{REPORTS_DIR_NAME, TestOutcome},
};
use camino::Utf8Path;
use sortie_metadata::{ReportedTest, TestReport, Verdict};
use std::sync::Mutex;

/// File name of the JSON report.
pub const JSON_REPORT_FILE_NAME: &str = "report.json";

/// Writes a [`TestReport`] as `report.json`.
#[derive(Debug)]
pub struct JsonReporter {
    report: Mutex<TestReport>,
}

impl JsonReporter {
    /// Creates a reporter for a run on `platform` with the given OS version.
    pub fn new(platform: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            report: Mutex::new(TestReport::new(platform, version)),
        }
    }

    fn with_report<T>(&self, f: impl FnOnce(&mut TestReport) -> T) -> T {
        let mut report = self
            .report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut report)
    }
}

impl Reporter for JsonReporter {
    fn report_test(&self, outcome: &TestOutcome) {
        let test = ReportedTest {
            name: outcome.name.clone(),
            result: outcome.verdict,
            duration: outcome.duration,
            output: outcome.output.clone(),
            subtests: outcome.subtests.clone(),
        };
        self.with_report(|report| report.tests.push(test));
    }

    fn set_result(&self, verdict: Verdict) {
        self.with_report(|report| report.result = verdict);
    }

    fn output(&self, dir: &Utf8Path) -> Result<(), ReportWriteError> {
        let path = dir.join(JSON_REPORT_FILE_NAME);
        let json = self
            .with_report(|report| report.to_json_pretty())
            .map_err(|error| ReportWriteError::Json {
                file: path.clone(),
                error,
            })?;
        std::fs::write(&path, json).map_err(|error| ReportWriteError::Fs { file: path, error })
    }
}

/// Reads the JSON report a previous run wrote into `output_dir`.
pub fn read_report(output_dir: &Utf8Path) -> Result<TestReport, ReportReadError> {
    let file = output_dir
        .join(REPORTS_DIR_NAME)
        .join(JSON_REPORT_FILE_NAME);
    let text = std::fs::read_to_string(&file).map_err(|error| ReportReadError::Read {
        file: file.clone(),
        error,
    })?;
    TestReport::parse(&text).map_err(|error| ReportReadError::Parse { file, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use std::time::Duration;

    #[test]
    fn writes_report() {
        let dir = Utf8TempDir::new().unwrap();
        let reporter = JsonReporter::new("qemu", "41.20241001.0");
        reporter.report_test(&TestOutcome {
            name: "basic".to_owned(),
            level: 1,
            verdict: Verdict::Fail,
            duration: Duration::from_millis(1500),
            output: "boom\n".to_owned(),
            subtests: vec![],
            non_exclusive_test_started: false,
            timed_out: false,
        });
        reporter.set_result(Verdict::Fail);
        reporter.output(dir.path()).unwrap();

        let text = std::fs::read_to_string(dir.path().join(JSON_REPORT_FILE_NAME)).unwrap();
        let report = TestReport::parse(&text).unwrap();
        assert_eq!(report.result, Verdict::Fail);
        assert_eq!(report.platform, "qemu");
        let failed: Vec<_> = report.failed_tests().map(|t| t.name.as_str()).collect();
        assert_eq!(failed, vec!["basic"]);
        assert_eq!(report.tests[0].duration, Duration::from_millis(1500));
    }

    #[test]
    fn reads_report_from_output_dir() {
        let dir = Utf8TempDir::new().unwrap();
        let reports = dir.path().join(REPORTS_DIR_NAME);
        std::fs::create_dir(&reports).unwrap();
        let reporter = JsonReporter::new("qemu", "");
        reporter.set_result(Verdict::Pass);
        reporter.output(&reports).unwrap();

        let report = read_report(dir.path()).unwrap();
        assert_eq!(report.result, Verdict::Pass);
        assert!(report.tests.is_empty());

        let err = read_report(&reports).unwrap_err();
        assert!(matches!(err, ReportReadError::Read { .. }), "{err}");
    }
}
