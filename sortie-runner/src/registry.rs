// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test definitions and the registries they live in.
//!
//! A [`TestSpec`] is an immutable description of one test. Tests are registered into a
//! [`Registry`] once at startup; every later stage of a run works on a [`RunnableSet`], a sorted
//! name-to-spec map that is rebuilt rather than mutated.

use crate::{
    conf::UserData,
    errors::RegistrationError,
    harness::TestResult,
    platform::TestCluster,
};
use camino::Utf8PathBuf;
use futures::{FutureExt, future::BoxFuture};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

/// The set of tests selected for a run, keyed and ordered by name.
pub type RunnableSet = BTreeMap<String, Arc<TestSpec>>;

/// Tag for tests that need network access from the machines under test.
pub const NEEDS_INTERNET_TAG: &str = "needs-internet";

/// Tag for tests whose success on rerun counts as a pass.
pub const ALLOW_RERUN_SUCCESS_TAG: &str = "allow-rerun-success";

/// Tag for tests that run on a single reference platform.
pub const PLATFORM_INDEPENDENT_TAG: &str = "platform-independent";

/// Tag for tests whose console and journal are not classified after the run.
pub const SKIP_BASE_CHECKS_TAG: &str = "skip-base-checks";

/// Tag added to every test discovered from an external test directory.
pub const EXTERNAL_TAG: &str = "external";

/// The future returned by a test body.
pub type TestFuture = BoxFuture<'static, TestResult>;

/// The body of a test: an async function invoked with the test's cluster.
#[derive(Clone)]
pub struct TestBody(Arc<dyn Fn(TestCluster) -> TestFuture + Send + Sync>);

impl TestBody {
    /// Wraps an async function as a test body.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TestCluster) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        Self(Arc::new(move |tc| f(tc).boxed()))
    }

    /// Invokes the body.
    pub fn call(&self, tc: TestCluster) -> TestFuture {
        (self.0)(tc)
    }
}

impl fmt::Debug for TestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TestBody")
    }
}

/// A local directory of data files copied to the machine before a test runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DependencyDir {
    /// The directory on this host.
    pub local: Utf8PathBuf,
    /// Where its contents land on the machine.
    pub remote: String,
}

/// A function that runs on the machine under test, dispatched by name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NativeFunc {
    /// Distributions this function must not run on.
    pub exclusions: Vec<String>,
}

/// Behavioral flags for a test.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Flag {
    /// Don't inject an SSH key into the user data.
    NoSshKeyInUserData,
    /// Don't inject an SSH key into platform metadata.
    NoSshKeyInMetadata,
    /// Don't grant the machines instance credentials.
    NoInstanceCreds,
    /// Don't fail the test if the machine dropped into an emergency shell.
    NoEmergencyShellCheck,
    /// Don't fail the test on user data warnings.
    AllowConfigWarnings,
}

impl Flag {
    /// Returns a kebab-case name for this flag.
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::NoSshKeyInUserData => "no-ssh-key-in-user-data",
            Flag::NoSshKeyInMetadata => "no-ssh-key-in-metadata",
            Flag::NoInstanceCreds => "no-instance-creds",
            Flag::NoEmergencyShellCheck => "no-emergency-shell-check",
            Flag::AllowConfigWarnings => "allow-config-warnings",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable description of a test.
#[derive(Clone, Debug)]
pub struct TestSpec {
    /// The unique name of the test.
    pub name: String,
    /// Description shown by `list`.
    pub description: String,
    /// Names of subtests, reported alongside the test.
    pub subtests: Vec<String>,
    /// The test body.
    pub run: TestBody,
    /// Functions dispatched to the machine under test.
    pub native_funcs: BTreeMap<String, NativeFunc>,
    /// User data machines boot with.
    pub user_data: UserData,
    /// Number of machines to provision before running the body. Zero means the body
    /// provisions its own.
    pub cluster_size: usize,

    /// Platforms this test may run on. Empty means all.
    pub platforms: Vec<String>,
    /// Platforms this test must not run on.
    pub exclude_platforms: Vec<String>,
    /// Distributions this test may run on. Empty means all.
    pub distros: Vec<String>,
    /// Distributions this test must not run on.
    pub exclude_distros: Vec<String>,
    /// Architectures this test may run on. Empty means all.
    pub architectures: Vec<String>,
    /// Architectures this test must not run on.
    pub exclude_architectures: Vec<String>,

    /// Behavioral flags.
    pub flags: Vec<Flag>,
    /// Tags used for selection and rerun policy.
    pub tags: Vec<String>,
    /// If set, the test only runs when this tag is requested explicitly.
    pub required_tag: Option<String>,
    /// Maximum time the test body may run. `None` uses the configured default.
    pub timeout: Option<Duration>,

    /// Path to an external test executable.
    pub external_test: Option<Utf8PathBuf>,
    /// Data files shipped alongside the external test.
    pub dependency_dir: Option<DependencyDir>,

    /// Abort the run if this test fails.
    pub fail_fast: bool,
    /// Whether this test may share a cluster with other tests.
    pub non_exclusive: bool,
    /// Names of tests that must not share a cluster with this one.
    pub conflicts: Vec<String>,
}

impl TestSpec {
    /// Creates a new spec with the given name and body, and defaults for everything else.
    pub fn new(name: impl Into<String>, run: TestBody) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            subtests: Vec::new(),
            run,
            native_funcs: BTreeMap::new(),
            user_data: UserData::Empty,
            cluster_size: 1,
            platforms: Vec::new(),
            exclude_platforms: Vec::new(),
            distros: Vec::new(),
            exclude_distros: Vec::new(),
            architectures: Vec::new(),
            exclude_architectures: Vec::new(),
            flags: Vec::new(),
            tags: Vec::new(),
            required_tag: None,
            timeout: None,
            external_test: None,
            dependency_dir: None,
            fail_fast: false,
            non_exclusive: false,
            conflicts: Vec::new(),
        }
    }

    /// Returns true if the test has the given flag.
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Returns true if the test has the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A collection of registered tests.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    tests: RunnableSet,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a test.
    ///
    /// Names must be unique, and tests declaring conflicts must be non-exclusive.
    pub fn register(&mut self, spec: TestSpec) -> Result<(), RegistrationError> {
        if self.tests.contains_key(&spec.name) {
            return Err(RegistrationError::Duplicate { name: spec.name });
        }
        if !spec.conflicts.is_empty() && !spec.non_exclusive {
            return Err(RegistrationError::ExclusiveWithConflicts { name: spec.name });
        }
        self.tests.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    /// Looks up a test by name.
    pub fn get(&self, name: &str) -> Option<&Arc<TestSpec>> {
        self.tests.get(name)
    }

    /// Iterates over registered tests in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TestSpec>> + '_ {
        self.tests.values()
    }

    /// The number of registered tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns true if no tests are registered.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Returns every registered test as a runnable set.
    pub fn to_runnable_set(&self) -> RunnableSet {
        self.tests.clone()
    }
}

/// The registries a run selects tests from.
#[derive(Clone, Debug, Default)]
pub struct Registries {
    /// Regular tests.
    pub tests: Registry,
    /// Tests that run against an upgraded machine.
    pub upgrade_tests: Registry,
}

/// Replicates every test in `tests` `count` times, naming the copies `{name}{i}` for `i` in
/// `0..count`. A count of 1 or less returns the input unchanged.
pub fn multiply(tests: RunnableSet, count: usize) -> RunnableSet {
    if count <= 1 {
        return tests;
    }
    let mut out = RunnableSet::new();
    for spec in tests.values() {
        for i in 0..count {
            let mut copy = TestSpec::clone(spec);
            copy.name = format!("{}{i}", spec.name);
            out.insert(copy.name.clone(), Arc::new(copy));
        }
    }
    out
}

/// Returns the union of all tags declared by `tests`.
pub fn all_tags<'a>(tests: impl IntoIterator<Item = &'a Arc<TestSpec>>) -> BTreeSet<&'a str> {
    tests
        .into_iter()
        .flat_map(|t| t.tags.iter().map(String::as_str))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(name: &str) -> TestSpec {
        TestSpec::new(name, TestBody::new(|_| async { Ok(()) }))
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut registry = Registry::new();
        registry.register(spec("basic")).unwrap();
        let err = registry.register(spec("basic")).unwrap_err();
        assert_eq!(err.to_string(), "test `basic` is already registered");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_rejects_exclusive_conflicts() {
        let mut registry = Registry::new();
        let mut s = spec("conflicted");
        s.conflicts = vec!["other".to_owned()];
        registry.register(s.clone()).unwrap_err();

        s.non_exclusive = true;
        registry.register(s).unwrap();
    }

    #[test]
    fn multiply_names() {
        let tests: RunnableSet = [spec("a"), spec("b")]
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();

        assert_eq!(multiply(tests.clone(), 1).len(), 2);
        let names: Vec<_> = multiply(tests, 3).into_keys().collect();
        assert_eq!(names, vec!["a0", "a1", "a2", "b0", "b1", "b2"]);
    }
}
