// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Selecting tests by name, tag, platform, architecture and distribution.

use crate::{
    errors::{PatternError, TestFilterBuildError},
    registry::{NEEDS_INTERNET_TAG, PLATFORM_INDEPENDENT_TAG, RunnableSet, TestSpec},
};
use globset::{Glob, GlobBuilder, GlobMatcher};
use std::{fmt, sync::Arc};
use tracing::debug;

/// A shell-style glob matched against whole test names.
///
/// `*` and `?` don't match `/`, so `basic*` doesn't select subtests of `basic`.
#[derive(Clone)]
pub struct NamePattern {
    glob: Glob,
    matcher: GlobMatcher,
}

impl NamePattern {
    /// Compiles a pattern.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|err| PatternError::new(pattern, err))?;
        let matcher = glob.compile_matcher();
        Ok(Self { glob, matcher })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        self.glob.glob()
    }

    /// Returns true if `name` matches the pattern.
    pub fn is_match(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }
}

impl fmt::Debug for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamePattern").field(&self.as_str()).finish()
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns `(allowed, excluded)` for `item` against an allow-list and a deny-list.
///
/// An empty allow-list allows everything. An item on the deny-list is never allowed.
pub fn is_allowed(item: &str, include: &[String], exclude: &[String]) -> (bool, bool) {
    let allowed = include.is_empty() || include.iter().any(|i| i == item);
    let excluded = exclude.iter().any(|e| e == item);
    (allowed && !excluded, excluded)
}

/// Builds a [`TestFilter`].
#[derive(Clone, Debug)]
pub struct TestFilterBuilder {
    patterns: Vec<NamePattern>,
    user_typed_pattern: bool,
    positive_tags: Vec<String>,
    negative_tags: Vec<String>,
    platform: String,
    arch: String,
    distro: String,
    no_net: bool,
    force_platform_independent: bool,
    platform_independent_platform: String,
}

impl TestFilterBuilder {
    /// Creates a builder for the given name patterns, platform and architecture.
    ///
    /// An empty list of patterns selects everything. A pattern list containing `*` counts as
    /// not typed by the user, so tags alone decide the selection.
    pub fn new(
        patterns: impl IntoIterator<Item = impl AsRef<str>>,
        platform: impl Into<String>,
        arch: impl Into<String>,
    ) -> Result<Self, TestFilterBuildError> {
        let mut patterns = patterns
            .into_iter()
            .map(|p| NamePattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            patterns.push(NamePattern::new("*")?);
        }
        let user_typed_pattern = !patterns.iter().any(|p| p.as_str() == "*");
        Ok(Self {
            patterns,
            user_typed_pattern,
            positive_tags: Vec::new(),
            negative_tags: Vec::new(),
            platform: platform.into(),
            arch: arch.into(),
            distro: String::new(),
            no_net: false,
            force_platform_independent: false,
            platform_independent_platform: "qemu".to_owned(),
        })
    }

    /// Sets the tags to select by. Tags starting with `!` exclude tests instead.
    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = impl AsRef<str>>) -> &mut Self {
        self.positive_tags.clear();
        self.negative_tags.clear();
        for tag in tags {
            let tag = tag.as_ref();
            match tag.strip_prefix('!') {
                Some(negative) => self.negative_tags.push(negative.to_owned()),
                None => self.positive_tags.push(tag.to_owned()),
            }
        }
        self
    }

    /// Sets the distribution under test.
    pub fn set_distro(&mut self, distro: impl Into<String>) -> &mut Self {
        self.distro = distro.into();
        self
    }

    /// Excludes tests that need internet access.
    pub fn set_no_net(&mut self, no_net: bool) -> &mut Self {
        self.no_net = no_net;
        self
    }

    /// Runs platform-independent tests on every platform instead of just one.
    pub fn set_force_platform_independent(&mut self, force: bool) -> &mut Self {
        self.force_platform_independent = force;
        self
    }

    /// Sets the platform that platform-independent tests are pinned to.
    pub fn set_platform_independent_platform(&mut self, platform: impl Into<String>) -> &mut Self {
        self.platform_independent_platform = platform.into();
        self
    }

    /// Builds the filter.
    pub fn build(&self) -> TestFilter {
        TestFilter {
            builder: self.clone(),
        }
    }
}

/// Selects tests for a run.
#[derive(Clone, Debug)]
pub struct TestFilter {
    builder: TestFilterBuilder,
}

impl TestFilter {
    /// Checks that every pattern matches at least one test in `tests`.
    pub fn check_patterns(&self, tests: &RunnableSet) -> Result<(), TestFilterBuildError> {
        for pattern in &self.builder.patterns {
            if !tests.keys().any(|name| pattern.is_match(name)) {
                return Err(TestFilterBuildError::NoMatches {
                    pattern: pattern.as_str().to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Returns true if `name` matches any of the name patterns.
    pub fn name_matches(&self, name: &str) -> bool {
        self.builder.patterns.iter().any(|p| p.is_match(name))
    }

    /// Returns the tests in `tests` selected by this filter.
    ///
    /// Native functions excluded for the current architecture or distribution are removed from
    /// the returned specs.
    pub fn filter(&self, tests: &RunnableSet) -> RunnableSet {
        tests
            .values()
            .filter_map(|t| self.select(t).map(|t| (t.name.clone(), t)))
            .collect()
    }

    fn select(&self, t: &Arc<TestSpec>) -> Option<Arc<TestSpec>> {
        let b = &self.builder;
        if b.no_net && t.has_tag(NEEDS_INTERNET_TAG) {
            debug!("skipping test that requires network: {}", t.name);
            return None;
        }

        let name_match = self.name_matches(&t.name);
        let tag_match = b
            .positive_tags
            .iter()
            .any(|tag| t.has_tag(tag) || t.required_tag.as_deref() == Some(tag.as_str()));
        if b.negative_tags.iter().any(|tag| t.has_tag(tag)) {
            return None;
        }

        if let Some(required) = &t.required_tag {
            let requested = b.positive_tags.iter().any(|tag| tag == required);
            if !requested && (!b.user_typed_pattern || !name_match) {
                return None;
            }
        }

        if b.user_typed_pattern {
            if !name_match && !tag_match {
                return None;
            }
        } else if !b.positive_tags.is_empty() && !tag_match {
            return None;
        }

        let pinned;
        let platforms = if !b.force_platform_independent && t.has_tag(PLATFORM_INDEPENDENT_TAG) {
            pinned = [b.platform_independent_platform.clone()];
            &pinned[..]
        } else {
            &t.platforms[..]
        };
        let (platform_allowed, _) = is_allowed(&b.platform, platforms, &t.exclude_platforms);
        let (arch_allowed, _) = is_allowed(&b.arch, &t.architectures, &t.exclude_architectures);
        if !platform_allowed || !arch_allowed {
            return None;
        }

        let (distro_allowed, _) = is_allowed(&b.distro, &t.distros, &t.exclude_distros);
        if !distro_allowed {
            return None;
        }

        let excluded_funcs: Vec<&String> = t
            .native_funcs
            .iter()
            .filter(|(_, func)| {
                func.exclusions
                    .iter()
                    .any(|e| *e == b.distro || *e == b.arch)
            })
            .map(|(name, _)| name)
            .collect();
        if excluded_funcs.is_empty() {
            return Some(t.clone());
        }
        let mut pruned = TestSpec::clone(t);
        for name in excluded_funcs {
            pruned.native_funcs.remove(name);
        }
        Some(Arc::new(pruned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NativeFunc, TestBody};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;
    use test_strategy::proptest;

    fn spec(name: &str) -> TestSpec {
        TestSpec::new(name, TestBody::new(|_| async { Ok(()) }))
    }

    fn bank(specs: Vec<TestSpec>) -> RunnableSet {
        specs
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect()
    }

    fn names(set: &RunnableSet) -> Vec<&str> {
        set.keys().map(String::as_str).collect()
    }

    #[test_case("basic*", "basic", true; "star prefix")]
    #[test_case("basic*", "basic.nvme", true; "star suffix")]
    #[test_case("basic*", "basic/sub", false; "star stops at slash")]
    #[test_case("basic/*", "basic/sub", true; "explicit subtest")]
    #[test_case("ext.config.?", "ext.config.a", true; "question mark")]
    #[test_case("[ab]x", "bx", true; "class")]
    fn pattern_matching(pattern: &str, name: &str, expected: bool) {
        let pattern = NamePattern::new(pattern).unwrap();
        assert_eq!(pattern.is_match(name), expected);
    }

    #[test_case(&[], &[], "x", (true, false); "no constraints")]
    #[test_case(&["x"], &[], "x", (true, false); "included")]
    #[test_case(&["y"], &[], "x", (false, false); "not included")]
    #[test_case(&[], &["x"], "x", (false, true); "excluded")]
    #[test_case(&["x"], &["x"], "x", (false, true); "included and excluded")]
    fn allowed(include: &[&str], exclude: &[&str], item: &str, expected: (bool, bool)) {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        assert_eq!(is_allowed(item, &include, &exclude), expected);
    }

    #[test]
    fn tags_and_required_tags() {
        let mut a = spec("a");
        a.tags = vec!["reprovision".to_owned()];
        let mut b = spec("b");
        b.required_tag = Some("openshift".to_owned());
        let tests = bank(vec![a, b, spec("c")]);

        let all = TestFilterBuilder::new(["*"], "qemu", "x86_64").unwrap().build();
        assert_eq!(names(&all.filter(&tests)), vec!["a", "c"]);

        let by_name = TestFilterBuilder::new(["b"], "qemu", "x86_64").unwrap().build();
        assert_eq!(names(&by_name.filter(&tests)), vec!["b"]);

        let mut builder = TestFilterBuilder::new(["*"], "qemu", "x86_64").unwrap();
        builder.set_tags(["openshift"]);
        assert_eq!(names(&builder.build().filter(&tests)), vec!["b"]);

        builder.set_tags(["!reprovision"]);
        assert_eq!(names(&builder.build().filter(&tests)), vec!["c"]);
    }

    #[test]
    fn platform_independent_pinning() {
        let mut t = spec("pi");
        t.tags = vec![PLATFORM_INDEPENDENT_TAG.to_owned()];
        let tests = bank(vec![t]);

        let aws = TestFilterBuilder::new(["*"], "aws", "x86_64").unwrap();
        assert!(aws.build().filter(&tests).is_empty());
        let qemu = TestFilterBuilder::new(["*"], "qemu", "x86_64").unwrap();
        assert_eq!(qemu.build().filter(&tests).len(), 1);

        let mut forced = aws.clone();
        forced.set_force_platform_independent(true);
        assert_eq!(forced.build().filter(&tests).len(), 1);
        // The bank itself is left alone.
        assert!(tests["pi"].platforms.is_empty());
    }

    #[test]
    fn architecture_distro_and_network() {
        let mut arch = spec("arch");
        arch.exclude_architectures = vec!["s390x".to_owned()];
        let mut distro = spec("distro");
        distro.distros = vec!["rhcos".to_owned()];
        let mut net = spec("net");
        net.tags = vec![NEEDS_INTERNET_TAG.to_owned()];
        let tests = bank(vec![arch, distro, net]);

        let mut builder = TestFilterBuilder::new(["*"], "qemu", "s390x").unwrap();
        builder.set_distro("fcos");
        assert_eq!(names(&builder.build().filter(&tests)), vec!["net"]);

        builder.set_no_net(true);
        assert!(builder.build().filter(&tests).is_empty());
    }

    #[test]
    fn native_funcs_pruned() {
        let mut t = spec("natives");
        t.native_funcs = btreemap! {
            "Everywhere".to_owned() => NativeFunc::default(),
            "NotOnS390x".to_owned() => NativeFunc { exclusions: vec!["s390x".to_owned()] },
        };
        let tests = bank(vec![t]);
        let filter = TestFilterBuilder::new(["*"], "qemu", "s390x").unwrap().build();
        let selected = filter.filter(&tests);
        let funcs: Vec<_> = selected["natives"].native_funcs.keys().collect();
        assert_eq!(funcs, vec!["Everywhere"]);
        assert_eq!(tests["natives"].native_funcs.len(), 2);
    }

    #[test]
    fn unmatched_pattern_is_an_error() {
        let tests = bank(vec![spec("basic")]);
        let filter = TestFilterBuilder::new(["basic", "nope*"], "qemu", "x86_64")
            .unwrap()
            .build();
        let err = filter.check_patterns(&tests).unwrap_err();
        assert_eq!(err.to_string(), "no tests matched pattern `nope*`");
    }

    #[test]
    fn empty_distro_skips_distro_restricted_tests() {
        let mut restricted = spec("restricted");
        restricted.distros = vec!["rhcos".to_owned()];
        let mut denied = spec("denied");
        denied.exclude_distros = vec!["rhcos".to_owned()];
        let tests = bank(vec![restricted, denied, spec("anywhere")]);

        let mut builder = TestFilterBuilder::new(["*"], "qemu", "x86_64").unwrap();
        assert_eq!(
            names(&builder.build().filter(&tests)),
            vec!["anywhere", "denied"]
        );

        builder.set_distro("rhcos");
        assert_eq!(
            names(&builder.build().filter(&tests)),
            vec!["anywhere", "restricted"]
        );
    }

    const SPEC_TAGS: &[&str] = &[
        "reprovision",
        "openshift",
        PLATFORM_INDEPENDENT_TAG,
        NEEDS_INTERNET_TAG,
    ];
    const FILTER_TAGS: &[&str] = &["reprovision", "openshift", "!reprovision", "!openshift"];
    const PLATFORMS: &[&str] = &["qemu", "aws", "gcp"];
    const DISTROS: &[&str] = &["", "fcos", "rhcos"];
    const PATTERNS: &[&str] = &["*", "t1*", "t?", "t[0-4]"];

    #[derive(Debug, test_strategy::Arbitrary)]
    struct SpecShape {
        #[strategy(proptest::sample::subsequence(SPEC_TAGS, 0..=SPEC_TAGS.len()))]
        tags: Vec<&'static str>,
        #[strategy(proptest::option::of(proptest::sample::select(&SPEC_TAGS[..2])))]
        required_tag: Option<&'static str>,
        #[strategy(proptest::sample::subsequence(PLATFORMS, 0..=2))]
        platforms: Vec<&'static str>,
        #[strategy(proptest::sample::subsequence(&DISTROS[1..], 0..=2))]
        distros: Vec<&'static str>,
        #[strategy(proptest::sample::subsequence(&DISTROS[1..], 0..=1))]
        exclude_distros: Vec<&'static str>,
        excluded_on_distro: bool,
    }

    #[derive(Debug, test_strategy::Arbitrary)]
    struct FilterInput {
        #[strategy(proptest::collection::vec(any::<SpecShape>(), 0..16))]
        specs: Vec<SpecShape>,
        #[strategy(proptest::sample::subsequence(PATTERNS, 1..=2))]
        patterns: Vec<&'static str>,
        #[strategy(proptest::sample::subsequence(FILTER_TAGS, 0..=2))]
        tags: Vec<&'static str>,
        #[strategy(proptest::sample::select(PLATFORMS))]
        platform: &'static str,
        #[strategy(proptest::sample::select(DISTROS))]
        distro: &'static str,
        no_net: bool,
        force_platform_independent: bool,
    }

    fn to_strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[proptest]
    fn filtering_is_idempotent(input: FilterInput) {
        let specs = input
            .specs
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                let mut t = spec(&format!("t{i}"));
                t.tags = to_strings(&shape.tags);
                t.required_tag = shape.required_tag.map(str::to_owned);
                t.platforms = to_strings(&shape.platforms);
                t.distros = to_strings(&shape.distros);
                t.exclude_distros = to_strings(&shape.exclude_distros);
                t.native_funcs = btreemap! {
                    "Always".to_owned() => NativeFunc::default(),
                };
                if shape.excluded_on_distro {
                    t.native_funcs.insert(
                        "Sometimes".to_owned(),
                        NativeFunc { exclusions: vec![input.distro.to_owned()] },
                    );
                }
                t
            })
            .collect();
        let tests = bank(specs);

        let mut builder =
            TestFilterBuilder::new(&input.patterns, input.platform, "x86_64").unwrap();
        builder
            .set_tags(&input.tags)
            .set_distro(input.distro)
            .set_no_net(input.no_net)
            .set_force_platform_independent(input.force_platform_independent);
        let filter = builder.build();

        let once = filter.filter(&tests);
        let twice = filter.filter(&once);
        prop_assert_eq!(names(&once), names(&twice));
        for (name, t) in &once {
            prop_assert!(tests.contains_key(name));
            prop_assert_eq!(
                t.native_funcs.keys().collect::<Vec<_>>(),
                twice[name].native_funcs.keys().collect::<Vec<_>>()
            );
        }
    }
}
