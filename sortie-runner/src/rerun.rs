// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rerun triage: deciding which failed tests get a second chance, and what the rerun means for
//! the final verdict.

use crate::{
    bucket::{is_bucket_wrapper, strip_bucket_prefix},
    denylist::Denylist,
    harness::TestOutcome,
    registry::{ALLOW_RERUN_SUCCESS_TAG, RunnableSet, TestSpec},
    run::RunVerdict,
};
use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex},
};
use tracing::warn;

/// Returns the name of the test behind a node, or `None` for bucket wrappers.
pub fn base_test_name(name: &str) -> Option<&str> {
    if is_bucket_wrapper(name) {
        None
    } else {
        Some(strip_bucket_prefix(name))
    }
}

/// Returns the name to rerun for a failed node, if it can be rerun at all.
///
/// Bucket wrappers, subtests of exclusive tests and warn-on-failure tests are not rerunnable.
pub fn rerunnable_test_name<'a>(name: &'a str, denylist: &Denylist) -> Option<&'a str> {
    let name = base_test_name(name)?;
    if name.contains('/') || denylist.is_warn_on_failure(name) {
        return None;
    }
    Some(name)
}

/// Tests whose success on rerun has been allowed by the harness during this run.
///
/// Clones share the same set.
#[derive(Clone, Debug, Default)]
pub struct RerunMarks {
    marked: Arc<Mutex<BTreeSet<String>>>,
}

impl RerunMarks {
    /// Creates an empty set of marks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `test` to pass on rerun. Marking a bucket wrapper marks each of its members.
    pub fn mark(&self, test: &TestSpec, reason: impl fmt::Display) {
        let names: Vec<&str> = if is_bucket_wrapper(&test.name) {
            test.subtests.iter().map(String::as_str).collect()
        } else {
            vec![test.name.as_str()]
        };
        let mut marked = self.lock();
        for name in names {
            if !test.has_tag(ALLOW_RERUN_SUCCESS_TAG) && marked.insert(name.to_owned()) {
                warn!("{reason} Adding as candidate for rerun success: {name}");
            }
        }
    }

    /// Returns true if `name` has been marked.
    pub fn is_marked(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.marked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outcomes that triage looks at: top-level tests, and the members of bucket wrappers.
fn triaged(outcomes: &[TestOutcome]) -> impl Iterator<Item = &TestOutcome> + '_ {
    outcomes.iter().filter(|o| {
        o.level == 1 || (o.level == 2 && strip_bucket_prefix(&o.name).len() < o.name.len())
    })
}

/// Returns the tests in `bank` that should be rerun after a run with `outcomes`.
///
/// A failed bucket wrapper that never got to start any member is retried member by member.
pub fn rerun_candidates(
    bank: &RunnableSet,
    outcomes: &[TestOutcome],
    denylist: &Denylist,
) -> RunnableSet {
    let mut names = BTreeSet::new();
    for outcome in triaged(outcomes) {
        if !outcome.failed() {
            continue;
        }
        if is_bucket_wrapper(&outcome.name) {
            if !outcome.non_exclusive_test_started {
                names.extend(outcome.subtests.iter().map(String::as_str));
            }
        } else if let Some(name) = rerunnable_test_name(&outcome.name, denylist) {
            names.insert(name);
        }
    }
    bank.iter()
        .filter(|(name, _)| names.contains(name.as_str()))
        .map(|(name, spec)| (name.clone(), spec.clone()))
        .collect()
}

/// Returns the names of failed tests whose failures only warn.
pub fn warn_failed_tests(outcomes: &[TestOutcome], denylist: &Denylist) -> Vec<String> {
    triaged(outcomes)
        .filter(|o| o.failed())
        .filter_map(|o| base_test_name(&o.name))
        .filter(|name| denylist.is_warn_on_failure(name))
        .map(str::to_owned)
        .collect()
}

/// Returns true if every test in `tests` may pass on rerun: it carries one of `approved_tags`,
/// or it was marked during the run. An approved tag of `all` or `*` approves everything.
pub fn all_allow_rerun_success(
    tests: &RunnableSet,
    approved_tags: &[String],
    marks: &RerunMarks,
) -> bool {
    if approved_tags.iter().any(|t| t == "all" || t == "*") {
        return true;
    }
    tests.values().all(|test| {
        marks.is_marked(&test.name)
            || test.tags.iter().any(|tag| {
                tag == ALLOW_RERUN_SUCCESS_TAG || approved_tags.iter().any(|a| a == tag)
            })
    })
}

/// The outcome of triage after a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reconciled {
    /// The final verdict.
    pub verdict: RunVerdict,
    /// Number of failed tests counted against the run.
    pub failed: usize,
}

/// Combines the first run's verdict with the rerun's, if there was one.
///
/// A clean rerun turns the run into a pass only if every rerun test allows rerun success.
/// Otherwise the first run's failure stands. A rerun that ran nothing is not clean. If the only
/// failures were warn-on-failure tests, the run warns.
pub fn reconcile(
    first: RunVerdict,
    candidates: usize,
    rerun: Option<RunVerdict>,
    rerun_success_allowed: bool,
    warn_failures: bool,
) -> Reconciled {
    let mut verdict = first;
    let mut failed = candidates;
    if let Some(rerun) = rerun {
        match rerun {
            RunVerdict::Pass if rerun_success_allowed => {
                verdict = RunVerdict::Pass;
                failed = 0;
            }
            RunVerdict::Pass | RunVerdict::NoTestsRun => {}
            RunVerdict::Fail | RunVerdict::Warn => verdict = rerun,
        }
    }
    if warn_failures && failed == 0 {
        verdict = RunVerdict::Warn;
    }
    Reconciled { verdict, failed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{denylist::DenyContext, registry::TestBody};
    use chrono::NaiveDate;
    use sortie_metadata::Verdict;
    use std::time::Duration;
    use test_case::test_case;

    fn spec(name: &str, tags: &[&str]) -> TestSpec {
        let mut spec = TestSpec::new(name, TestBody::new(|_| async { Ok(()) }));
        spec.tags = tags.iter().map(|t| (*t).to_owned()).collect();
        spec
    }

    fn bank(specs: impl IntoIterator<Item = TestSpec>) -> RunnableSet {
        specs
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect()
    }

    fn outcome(name: &str, level: usize, verdict: Verdict) -> TestOutcome {
        TestOutcome {
            name: name.to_owned(),
            level,
            verdict,
            duration: Duration::ZERO,
            output: String::new(),
            subtests: Vec::new(),
            non_exclusive_test_started: false,
            timed_out: false,
        }
    }

    fn warn_denylist(pattern: &str) -> Denylist {
        let rules = Denylist::parse_rules(&format!("- pattern: {pattern}\n  warn: true\n")).unwrap();
        let ctx = DenyContext {
            arch: "x86_64".to_owned(),
            platform: "qemu".to_owned(),
            stream: None,
            os_version: None,
            today: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        };
        Denylist::resolve(&rules, &ctx).unwrap()
    }

    #[test_case("basic", Some("basic"); "top level")]
    #[test_case("non-exclusive-test-bucket-0", None; "wrapper")]
    #[test_case("non-exclusive-test-bucket-0/ext.foo", Some("ext.foo"); "member")]
    #[test_case("basic/subtest", None; "exclusive subtest")]
    #[test_case("flaky.warned", None; "warn on failure")]
    fn rerunnable_names(name: &str, expected: Option<&str>) {
        let denylist = warn_denylist("flaky.*");
        assert_eq!(rerunnable_test_name(name, &denylist), expected);
    }

    #[test]
    fn candidates_from_failures() {
        let bank = bank([
            spec("basic", &[]),
            spec("passing", &[]),
            spec("ext.a", &[]),
            spec("ext.b", &[]),
            spec("ext.c", &[]),
        ]);
        let mut wrapper = outcome("non-exclusive-test-bucket-0", 1, Verdict::Fail);
        wrapper.subtests = vec!["ext.a".to_owned(), "ext.b".to_owned()];
        let outcomes = vec![
            outcome("basic", 1, Verdict::Fail),
            outcome("basic/inner", 2, Verdict::Fail),
            outcome("passing", 1, Verdict::Pass),
            wrapper,
            outcome("non-exclusive-test-bucket-1", 1, Verdict::Pass),
            outcome("non-exclusive-test-bucket-1/ext.c", 2, Verdict::Pass),
        ];

        let names: Vec<_> = rerun_candidates(&bank, &outcomes, &Denylist::new())
            .into_keys()
            .collect();
        assert_eq!(names, vec!["basic", "ext.a", "ext.b"]);
    }

    #[test]
    fn started_wrapper_reruns_failed_members_only() {
        let bank = bank([spec("ext.a", &[]), spec("ext.b", &[])]);
        let mut wrapper = outcome("non-exclusive-test-bucket-0", 1, Verdict::Fail);
        wrapper.subtests = vec!["ext.a".to_owned(), "ext.b".to_owned()];
        wrapper.non_exclusive_test_started = true;
        let outcomes = vec![
            wrapper,
            outcome("non-exclusive-test-bucket-0/ext.a", 2, Verdict::Pass),
            outcome("non-exclusive-test-bucket-0/ext.b", 2, Verdict::Fail),
        ];

        let names: Vec<_> = rerun_candidates(&bank, &outcomes, &Denylist::new())
            .into_keys()
            .collect();
        assert_eq!(names, vec!["ext.b"]);
    }

    #[test]
    fn warn_failures_are_reported() {
        let denylist = warn_denylist("flaky.*");
        let outcomes = vec![
            outcome("flaky.one", 1, Verdict::Warn),
            outcome("flaky.two", 1, Verdict::Pass),
            outcome("basic", 1, Verdict::Fail),
        ];
        assert_eq!(warn_failed_tests(&outcomes, &denylist), vec!["flaky.one"]);
        let names: Vec<_> = rerun_candidates(
            &bank([spec("flaky.one", &[]), spec("basic", &[])]),
            &outcomes,
            &denylist,
        )
        .into_keys()
        .collect();
        assert_eq!(names, vec!["basic"]);
    }

    #[test]
    fn rerun_success_needs_approval() {
        let tests = bank([spec("a", &["flaky"]), spec("b", &[])]);
        let marks = RerunMarks::new();
        assert!(!all_allow_rerun_success(&tests, &["flaky".to_owned()], &marks));
        assert!(all_allow_rerun_success(&tests, &["*".to_owned()], &marks));

        marks.mark(&tests["b"], "Test timed out.");
        assert!(all_allow_rerun_success(&tests, &["flaky".to_owned()], &marks));
    }

    #[test]
    fn marking_a_wrapper_marks_members() {
        let mut wrapper = spec("non-exclusive-test-bucket-2", &[]);
        wrapper.subtests = vec!["ext.a".to_owned(), "ext.b".to_owned()];
        let marks = RerunMarks::new();
        marks.mark(&wrapper, "Platform failed starting machines.");
        assert!(marks.is_marked("ext.a"));
        assert!(marks.is_marked("ext.b"));
        assert!(!marks.is_marked("non-exclusive-test-bucket-2"));
    }

    #[test_case(RunVerdict::Fail, 1, Some(RunVerdict::Pass), true, false => Reconciled { verdict: RunVerdict::Pass, failed: 0 }; "clean rerun")]
    #[test_case(RunVerdict::Fail, 1, Some(RunVerdict::Pass), false, false => Reconciled { verdict: RunVerdict::Fail, failed: 1 }; "unapproved rerun")]
    #[test_case(RunVerdict::Fail, 1, Some(RunVerdict::Fail), true, false => Reconciled { verdict: RunVerdict::Fail, failed: 1 }; "failed rerun")]
    #[test_case(RunVerdict::Fail, 1, Some(RunVerdict::NoTestsRun), true, false => Reconciled { verdict: RunVerdict::Fail, failed: 1 }; "rerun ran nothing")]
    #[test_case(RunVerdict::Fail, 0, None, true, true => Reconciled { verdict: RunVerdict::Warn, failed: 0 }; "only warnings")]
    #[test_case(RunVerdict::Fail, 2, None, true, true => Reconciled { verdict: RunVerdict::Fail, failed: 2 }; "warnings and failures")]
    #[test_case(RunVerdict::Fail, 1, Some(RunVerdict::Pass), true, true => Reconciled { verdict: RunVerdict::Warn, failed: 0 }; "rerun passes with warnings")]
    fn reconciliation(
        first: RunVerdict,
        candidates: usize,
        rerun: Option<RunVerdict>,
        allowed: bool,
        warn_failures: bool,
    ) -> Reconciled {
        reconcile(first, candidates, rerun, allowed, warn_failures)
    }
}
