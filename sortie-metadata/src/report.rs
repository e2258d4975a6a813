// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// The terminal state of a test, or of a whole run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// The test passed.
    Pass,

    /// The test failed.
    Fail,

    /// The test was skipped.
    Skip,

    /// The test failed, but it was marked as warn-on-failure.
    Warn,
}

impl Verdict {
    /// Returns the verdict as it appears in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Skip => "SKIP",
            Verdict::Warn => "WARN",
        }
    }

    /// Returns true if this verdict counts as a failure.
    pub fn is_failure(self) -> bool {
        matches!(self, Verdict::Fail)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON report written at the end of a run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// Every test and sub-test that reached a terminal state, in completion order.
    pub tests: Vec<ReportedTest>,

    /// The overall result of the run.
    pub result: Verdict,

    /// The platform the run targeted.
    pub platform: String,

    /// The version of the system under test, if known.
    #[serde(default)]
    pub version: String,
}

impl TestReport {
    /// Creates an empty report for the given platform. The result starts out as a pass.
    pub fn new(platform: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            tests: Vec::new(),
            result: Verdict::Pass,
            platform: platform.into(),
            version: version.into(),
        }
    }

    /// Parses a report from its JSON form.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes this report to pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Returns the tests in this report that failed.
    pub fn failed_tests(&self) -> impl Iterator<Item = &ReportedTest> + '_ {
        self.tests.iter().filter(|test| test.result.is_failure())
    }
}

/// A single test result within a [`TestReport`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportedTest {
    /// The full name of the test, with sub-test components separated by `/`.
    pub name: String,

    /// The verdict for this test.
    pub result: Verdict,

    /// How long the test ran for.
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Captured log output.
    #[serde(default)]
    pub output: String,

    /// The names of sub-tests this test declared, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtests: Vec<String>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn parse_report() {
        let input = indoc! {r#"
            {
                "tests": [
                    {"name": "basic", "result": "PASS", "duration": 12.5, "output": ""},
                    {"name": "ext.config.files", "result": "FAIL", "duration": 0.25},
                    {
                        "name": "non-exclusive-test-bucket-0",
                        "result": "FAIL",
                        "duration": 3,
                        "subtests": ["ext.a", "ext.b"]
                    }
                ],
                "result": "FAIL",
                "platform": "qemu"
            }
        "#};

        let report = TestReport::parse(input).expect("report parses");
        assert_eq!(report.platform, "qemu");
        assert_eq!(report.version, "", "version defaults to empty");
        assert_eq!(report.result, Verdict::Fail);
        assert_eq!(report.tests[0].duration, Duration::from_millis(12500));
        assert_eq!(report.tests[2].subtests, vec!["ext.a", "ext.b"]);

        let failed: Vec<_> = report.failed_tests().map(|t| t.name.as_str()).collect();
        assert_eq!(failed, vec!["ext.config.files", "non-exclusive-test-bucket-0"]);
    }

    #[test_case(Verdict::Pass, "\"PASS\""; "pass")]
    #[test_case(Verdict::Fail, "\"FAIL\""; "fail")]
    #[test_case(Verdict::Skip, "\"SKIP\""; "skip")]
    #[test_case(Verdict::Warn, "\"WARN\""; "warn")]
    fn verdict_serialization(verdict: Verdict, expected: &str) {
        assert_eq!(serde_json::to_string(&verdict).unwrap(), expected);
        assert_eq!(verdict.to_string(), &expected[1..expected.len() - 1]);
    }

    #[test]
    fn negative_duration_is_rejected() {
        let input = r#"{"name": "x", "result": "PASS", "duration": -1.0}"#;
        serde_json::from_str::<ReportedTest>(input).expect_err("negative durations are invalid");
    }
}
