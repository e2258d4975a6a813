// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packing non-exclusive tests onto shared machines.
//!
//! Non-exclusive tests are willing to share a machine with other tests. They are grouped into
//! buckets so that no two tests in a bucket conflict, and each bucket is run by a synthetic
//! wrapper test that boots one machine with the merged config of all its members and then runs
//! the members one after another as subtests.

use crate::{
    conf::{Config, UserData, WarningsAction},
    errors::BucketError,
    harness::TestResult,
    platform::TestCluster,
    registry::{Flag, NEEDS_INTERNET_TAG, RunnableSet, TestBody, TestFuture, TestSpec},
};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, LazyLock},
    time::Duration,
};
use tracing::debug;

/// Prefix of every bucket wrapper's name.
pub const BUCKET_NAME_PREFIX: &str = "non-exclusive-test-bucket-";

static WRAPPER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^non-exclusive-test-bucket-[0-9]+$").expect("wrapper regex is valid")
});

static MEMBER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^non-exclusive-test-bucket-[0-9]+/").expect("member prefix regex is valid")
});

/// Flags a test may not carry if it shares a machine.
const FORBIDDEN_FLAGS: [Flag; 4] = [
    Flag::NoSshKeyInMetadata,
    Flag::NoSshKeyInUserData,
    Flag::NoInstanceCreds,
    Flag::AllowConfigWarnings,
];

/// Runs one bucket member against the bucket's cluster.
///
/// The cluster handed over is bound to the member's own node.
pub type MemberRunner = Arc<dyn Fn(TestCluster, Arc<TestSpec>) -> TestFuture + Send + Sync>;

/// Returns true if `name` is the name of a bucket wrapper.
pub fn is_bucket_wrapper(name: &str) -> bool {
    WRAPPER_NAME.is_match(name)
}

/// Strips a leading `non-exclusive-test-bucket-N/` from a node name, returning the member's own
/// test name.
pub fn strip_bucket_prefix(name: &str) -> &str {
    match MEMBER_PREFIX.find(name) {
        Some(m) => &name[m.end()..],
        None => name,
    }
}

/// Settings for [`bucket_tests`].
pub struct BucketOptions<'a> {
    /// Returns true if the platform can't boot a config this large.
    pub too_large: &'a (dyn Fn(&Config) -> bool + Sync),
    /// Timeout for members that don't declare one.
    pub member_default_timeout: Duration,
    /// Runs each member inside its wrapper.
    pub runner: MemberRunner,
}

/// Replaces the non-exclusive tests in `tests` with bucket wrappers.
///
/// A lone non-exclusive test gains nothing from sharing and is left to run on its own.
pub fn bucket_tests(
    tests: RunnableSet,
    options: &BucketOptions<'_>,
) -> Result<RunnableSet, BucketError> {
    let (non_exclusive, mut out): (RunnableSet, RunnableSet) =
        tests.into_iter().partition(|(_, spec)| spec.non_exclusive);

    if non_exclusive.len() <= 1 {
        out.extend(non_exclusive);
        return Ok(out);
    }

    let mut members = Vec::with_capacity(non_exclusive.len());
    for spec in non_exclusive.into_values() {
        if let Some(flag) = FORBIDDEN_FLAGS.into_iter().find(|f| spec.has_flag(*f)) {
            return Err(BucketError::ForbiddenFlag {
                name: spec.name.clone(),
                flag,
            });
        }
        let config =
            spec.user_data
                .render(WarningsAction::Fail)
                .map_err(|err| BucketError::Render {
                    name: spec.name.clone(),
                    err,
                })?;
        members.push(Member { spec, config });
    }

    let mut buckets = create_buckets(members);
    let mut index = 0;
    while index < buckets.len() {
        let merged = Config::merge_all(buckets[index].iter().map(|m| &m.config));
        if (options.too_large)(&merged) {
            let len = buckets[index].len();
            if len == 1 {
                return Err(BucketError::ConfigTooLarge {
                    name: buckets[index][0].spec.name.clone(),
                });
            }
            debug!("bucket {index}: merged config is too large, splitting {len} tests");
            let second = buckets[index].split_off(len / 2);
            buckets.push(second);
            continue;
        }

        let wrapper = make_wrapper(index, &buckets[index], &merged, options);
        out.insert(wrapper.name.clone(), Arc::new(wrapper));
        index += 1;
    }
    Ok(out)
}

struct Member {
    spec: Arc<TestSpec>,
    config: Config,
}

/// Greedily assigns members to buckets, in order: each goes into the first bucket holding none
/// of its conflicts.
fn create_buckets(members: Vec<Member>) -> Vec<Vec<Member>> {
    let present: BTreeSet<&str> = members.iter().map(|m| m.spec.name.as_str()).collect();
    let mut conflicts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for member in &members {
        for other in &member.spec.conflicts {
            conflicts
                .entry(member.spec.name.clone())
                .or_default()
                .insert(other.clone());
            if present.contains(other.as_str()) {
                conflicts
                    .entry(other.clone())
                    .or_default()
                    .insert(member.spec.name.clone());
            } else {
                debug!(
                    "{} declares {other} as a conflict, but {other} is not a non-exclusive test \
                     in this run",
                    member.spec.name
                );
            }
        }
    }

    let mut buckets: Vec<Vec<Member>> = Vec::new();
    for member in members {
        let own = conflicts.get(&member.spec.name);
        let fits = |bucket: &Vec<Member>| {
            own.is_none_or(|own| bucket.iter().all(|m| !own.contains(&m.spec.name)))
        };
        match buckets.iter_mut().find(|b| fits(b)) {
            Some(bucket) => bucket.push(member),
            None => buckets.push(vec![member]),
        }
    }
    buckets
}

fn make_wrapper(
    index: usize,
    members: &[Member],
    merged: &Config,
    options: &BucketOptions<'_>,
) -> TestSpec {
    let specs: Arc<[Arc<TestSpec>]> = members.iter().map(|m| m.spec.clone()).collect();
    let default_timeout = options.member_default_timeout;
    let runner = options.runner.clone();
    let body = {
        let specs = specs.clone();
        TestBody::new(move |tc| run_members(tc, specs.clone(), default_timeout, runner.clone()))
    };

    let mut wrapper = TestSpec::new(format!("{BUCKET_NAME_PREFIX}{index}"), body);
    wrapper.subtests = specs.iter().map(|s| s.name.clone()).collect();
    wrapper.user_data = UserData::Ignition(merged.to_json_string());
    wrapper.cluster_size = 1;
    if specs.iter().any(|s| s.has_tag(NEEDS_INTERNET_TAG)) {
        wrapper.tags.push(NEEDS_INTERNET_TAG.to_owned());
    }
    wrapper
}

async fn run_members(
    tc: TestCluster,
    members: Arc<[Arc<TestSpec>]>,
    default_timeout: Duration,
    runner: MemberRunner,
) -> TestResult {
    for member in members.iter() {
        let timeout = member.timeout.unwrap_or(default_timeout);
        let wrapper = tc.clone();
        let runner = runner.clone();
        let spec = member.clone();
        tc.h()
            .run_with_timeout(&member.name, Some(timeout), move |h| {
                wrapper.h().non_exclusive_test_started();
                runner(wrapper.with_h(h), spec)
            })
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;
    use test_strategy::proptest;

    fn body() -> TestBody {
        TestBody::new(|_| async { Ok(()) })
    }

    fn non_exclusive(name: &str, conflicts: &[&str]) -> Arc<TestSpec> {
        let mut spec = TestSpec::new(name, body());
        spec.non_exclusive = true;
        spec.conflicts = conflicts.iter().map(|c| (*c).to_owned()).collect();
        Arc::new(spec)
    }

    fn set(specs: impl IntoIterator<Item = Arc<TestSpec>>) -> RunnableSet {
        specs.into_iter().map(|s| (s.name.clone(), s)).collect()
    }

    fn noop_runner() -> MemberRunner {
        Arc::new(|_, _| async { Ok(()) }.boxed())
    }

    fn options(too_large: &(dyn Fn(&Config) -> bool + Sync)) -> BucketOptions<'_> {
        BucketOptions {
            too_large,
            member_default_timeout: Duration::from_secs(60),
            runner: noop_runner(),
        }
    }

    fn subtests(out: &RunnableSet) -> Vec<Vec<String>> {
        out.values()
            .filter(|s| is_bucket_wrapper(&s.name))
            .map(|s| s.subtests.clone())
            .collect()
    }

    #[test_case("non-exclusive-test-bucket-0", true; "single digit")]
    #[test_case("non-exclusive-test-bucket-123", true; "many digits")]
    #[test_case("non-exclusive-test-bucket-", false; "no digits")]
    #[test_case("non-exclusive-test-bucket-1/ext.foo", false; "member")]
    #[test_case("basic", false; "plain test")]
    fn wrapper_names(name: &str, expected: bool) {
        assert_eq!(is_bucket_wrapper(name), expected);
    }

    #[test_case("non-exclusive-test-bucket-3/ext.config.files", "ext.config.files"; "member")]
    #[test_case("ext.config.files", "ext.config.files"; "unprefixed")]
    #[test_case("basic/subtest", "basic/subtest"; "exclusive subtest")]
    fn strip_prefix(name: &str, expected: &str) {
        assert_eq!(strip_bucket_prefix(name), expected);
    }

    #[test]
    fn symmetric_conflicts_split_buckets() {
        let tests = set([
            non_exclusive("x", &["y"]),
            non_exclusive("y", &[]),
            non_exclusive("z", &[]),
        ]);
        let out = bucket_tests(tests, &options(&|_| false)).unwrap();
        assert_eq!(
            subtests(&out),
            vec![vec!["x".to_owned(), "z".to_owned()], vec!["y".to_owned()]]
        );
    }

    #[test]
    fn single_non_exclusive_runs_alone() {
        let tests = set([non_exclusive("lonely", &[]), Arc::new(TestSpec::new("excl", body()))]);
        let out = bucket_tests(tests, &options(&|_| false)).unwrap();
        let names: Vec<_> = out.keys().cloned().collect();
        assert_eq!(names, vec!["excl", "lonely"]);
    }

    #[test]
    fn forbidden_flags_are_rejected() {
        let mut flagged = TestSpec::clone(&non_exclusive("flagged", &[]));
        flagged.flags.push(Flag::NoInstanceCreds);
        let tests = set([Arc::new(flagged), non_exclusive("other", &[])]);
        let err = bucket_tests(tests, &options(&|_| false)).unwrap_err();
        assert!(matches!(
            err,
            BucketError::ForbiddenFlag {
                flag: Flag::NoInstanceCreds,
                ..
            }
        ));
    }

    #[test]
    fn oversized_buckets_are_split() {
        let tests = set(["a", "b", "c", "d"].map(|n| non_exclusive(n, &[])));
        // A config with one unit is 75 bytes, with two it is 96.
        let too_large = |config: &Config| config.serialized_len() > 85;
        let mut specs: Vec<_> = tests.values().map(|s| TestSpec::clone(s)).collect();
        for spec in &mut specs {
            spec.user_data = UserData::Ignition(format!(
                r#"{{"ignition":{{"version":"3.4.0"}},"systemd":{{"units":[{{"name":"{}.service"}}]}}}}"#,
                spec.name
            ));
        }
        let tests = set(specs.into_iter().map(Arc::new));
        let out = bucket_tests(tests, &options(&too_large)).unwrap();
        let buckets = subtests(&out);
        assert_eq!(buckets.len(), 4);
        assert!(buckets.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn oversized_single_test_is_an_error() {
        let tests = set([non_exclusive("a", &["b"]), non_exclusive("b", &[])]);
        let err = bucket_tests(tests, &options(&|_| true)).unwrap_err();
        assert!(matches!(err, BucketError::ConfigTooLarge { name } if name == "a"));
    }

    #[test]
    fn wrapper_carries_needs_internet() {
        let mut net = TestSpec::clone(&non_exclusive("net", &[]));
        net.tags.push(NEEDS_INTERNET_TAG.to_owned());
        let tests = set([Arc::new(net), non_exclusive("offline", &[])]);
        let out = bucket_tests(tests, &options(&|_| false)).unwrap();
        let wrapper = &out["non-exclusive-test-bucket-0"];
        assert!(wrapper.has_tag(NEEDS_INTERNET_TAG));
        assert!(!wrapper.non_exclusive);
        assert_eq!(wrapper.cluster_size, 1);
    }

    #[derive(Debug, test_strategy::Arbitrary)]
    struct ConflictGraph {
        #[strategy(2usize..12)]
        len: usize,
        #[strategy(proptest::collection::vec((0usize..12, 0usize..12), 0..20))]
        edges: Vec<(usize, usize)>,
    }

    #[proptest]
    fn buckets_never_hold_conflicts(graph: ConflictGraph) {
        let names: Vec<String> = (0..graph.len).map(|i| format!("t{i:02}")).collect();
        let mut conflicts: Vec<Vec<&str>> = vec![Vec::new(); graph.len];
        for (a, b) in graph.edges {
            let (a, b) = (a % graph.len, b % graph.len);
            if a != b {
                conflicts[a].push(&names[b]);
            }
        }
        let tests = set(
            names
                .iter()
                .zip(&conflicts)
                .map(|(name, c)| non_exclusive(name, c)),
        );
        let declared: BTreeMap<String, Vec<String>> = tests
            .values()
            .map(|s| (s.name.clone(), s.conflicts.clone()))
            .collect();

        let out = bucket_tests(tests, &options(&|_| false)).unwrap();
        let buckets = subtests(&out);

        let placed: usize = buckets.iter().map(Vec::len).sum();
        prop_assert_eq!(placed, graph.len);
        for bucket in &buckets {
            for a in bucket {
                for b in bucket {
                    prop_assert!(!declared[a].contains(b), "{a} and {b} share a bucket");
                }
            }
        }
    }
}
