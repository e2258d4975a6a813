// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Denylist and snooze processing.
//!
//! A denylist file is a YAML list of rules. Each rule names a test pattern and optionally scopes
//! itself to architectures, platforms, streams and OS versions. A rule either denies its tests
//! (they are not run), or marks them warn-on-failure (they run, but failures only warn). A
//! snooze date makes a deny rule temporary.

use crate::{
    errors::{DenylistParseError, PatternError},
    registry::RunnableSet,
    test_filter::NamePattern,
};
use camino::Utf8Path;
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Denylist pattern that turns every console finding into a warning.
pub const SKIP_CONSOLE_WARNINGS_PATTERN: &str = "skip-console-warnings";

const SNOOZE_FORMAT: &str = "%Y-%m-%d";

/// One entry in a denylist file.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DenyRule {
    /// Test name pattern.
    pub pattern: String,
    /// URL of the tracking issue.
    pub tracker: Option<String>,
    /// Streams the rule applies to. Empty means all.
    pub streams: Vec<String>,
    /// Architectures the rule applies to. Empty means all.
    pub arches: Vec<String>,
    /// Platforms the rule applies to. Empty means all.
    pub platforms: Vec<String>,
    /// Date until which the rule denies, as `YYYY-MM-DD`.
    pub snooze: Option<String>,
    /// OS versions the rule applies to. Empty means all.
    pub osversion: Vec<String>,
    /// Run matching tests, but downgrade their failures to warnings.
    pub warn: bool,
}

/// What the denylist is evaluated against.
#[derive(Clone, Debug)]
pub struct DenyContext {
    /// Architecture under test.
    pub arch: String,
    /// Platform under test.
    pub platform: String,
    /// Stream of the build under test, if known.
    pub stream: Option<String>,
    /// OS version of the build under test, if known.
    pub os_version: Option<String>,
    /// The current date.
    pub today: NaiveDate,
}

/// Stream and OS version variables read from a build manifest.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ManifestVariables {
    /// The build's stream.
    pub stream: Option<String>,
    /// The build's OS version.
    pub osversion: Option<String>,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    variables: ManifestVariables,
}

impl ManifestVariables {
    /// Reads the `variables` section of a YAML manifest.
    pub fn from_path(path: &Utf8Path) -> Result<Self, DenylistParseError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| DenylistParseError::Read {
                path: path.to_owned(),
                err,
            })?;
        let manifest: Manifest = serde_yaml::from_str(&text)
            .map_err(|err| DenylistParseError::Yaml {
                path: Some(path.to_owned()),
                err,
            })?;
        Ok(manifest.variables)
    }
}

/// The resolved denylist for a run.
#[derive(Clone, Debug, Default)]
pub struct Denylist {
    deny: Vec<NamePattern>,
    warn: Vec<NamePattern>,
    skip_console_warnings: bool,
}

impl Denylist {
    /// Creates an empty denylist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the rules in a denylist file.
    pub fn parse_rules(yaml: &str) -> Result<Vec<DenyRule>, DenylistParseError> {
        // An empty document has no rules.
        if yaml.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(yaml).map_err(|err| DenylistParseError::Yaml { path: None, err })
    }

    /// Reads and resolves a denylist file. A missing file is an empty denylist.
    pub fn from_path(path: &Utf8Path, ctx: &DenyContext) -> Result<Self, DenylistParseError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no denylist at {path}");
                return Ok(Self::new());
            }
            Err(err) => {
                return Err(DenylistParseError::Read {
                    path: path.to_owned(),
                    err,
                });
            }
        };
        let rules = Self::parse_rules(&text).map_err(|err| err.with_path(path))?;
        Self::resolve(&rules, ctx)
    }

    /// Resolves rules against the current run.
    pub fn resolve(rules: &[DenyRule], ctx: &DenyContext) -> Result<Self, DenylistParseError> {
        debug!(
            "denylist: resolving for stream {:?}, osversion {:?}, arch {}",
            ctx.stream, ctx.os_version, ctx.arch
        );
        let mut denylist = Self::new();
        for rule in rules {
            if !rule.arches.is_empty() && !rule.arches.contains(&ctx.arch) {
                continue;
            }
            if !rule.platforms.is_empty() && !rule.platforms.contains(&ctx.platform) {
                continue;
            }
            if let Some(stream) = ctx.stream.as_deref().filter(|s| !s.is_empty()) {
                if !rule.streams.is_empty() && !rule.streams.iter().any(|s| s == stream) {
                    continue;
                }
            }
            if let Some(version) = ctx.os_version.as_deref().filter(|s| !s.is_empty()) {
                if !rule.osversion.is_empty() && !rule.osversion.iter().any(|v| v == version) {
                    continue;
                }
            }

            if rule.pattern == SKIP_CONSOLE_WARNINGS_PATTERN {
                denylist.skip_console_warnings = true;
                continue;
            }

            let pattern = NamePattern::new(&rule.pattern)?;
            match &rule.snooze {
                Some(snooze) => {
                    let until = NaiveDate::parse_from_str(snooze, SNOOZE_FORMAT).map_err(|err| {
                        DenylistParseError::Snooze {
                            pattern: rule.pattern.clone(),
                            snooze: snooze.clone(),
                            err,
                        }
                    })?;
                    let date = until.format("%b %d %Y");
                    if ctx.today >= until {
                        info!("snooze for test pattern \"{pattern}\" expired on {date}");
                        if rule.warn {
                            info!("will warn on failure for test pattern \"{pattern}\"");
                            denylist.warn.push(pattern);
                        }
                    } else {
                        info!("snoozing test pattern \"{pattern}\" until {date}");
                        denylist.deny.push(pattern);
                    }
                }
                None if rule.warn => {
                    info!("will warn on failure for test pattern \"{pattern}\"");
                    denylist.warn.push(pattern);
                }
                None => {
                    info!("skipping test pattern \"{pattern}\"");
                    denylist.deny.push(pattern);
                }
            }
            if let Some(tracker) = &rule.tracker {
                info!("  tracked at {tracker}");
            }
        }
        Ok(denylist)
    }

    /// Adds a pattern denied from the command line.
    pub fn add_deny_pattern(&mut self, pattern: &str) -> Result<(), PatternError> {
        self.deny.push(NamePattern::new(pattern)?);
        Ok(())
    }

    /// Returns true if `name` is denied outright.
    pub fn is_denylisted(&self, name: &str) -> bool {
        self.deny.iter().any(|p| p.is_match(name))
    }

    /// Returns true if failures of `name` only warn.
    pub fn is_warn_on_failure(&self, name: &str) -> bool {
        self.warn.iter().any(|p| p.is_match(name))
    }

    /// Returns true if console findings are all downgraded to warnings.
    pub fn skip_console_warnings(&self) -> bool {
        self.skip_console_warnings
    }

    /// Removes denied tests from `tests`.
    ///
    /// A pattern of the form `test/glob` denies no tests. It removes native functions matching
    /// `glob` from tests matching `test`.
    pub fn filter(&self, tests: &RunnableSet) -> RunnableSet {
        let mut out = RunnableSet::new();
        for (name, spec) in tests {
            if self.is_denylisted(name) {
                debug!("skipping denylisted test {name}");
                continue;
            }
            let denied_funcs: Vec<&String> = spec
                .native_funcs
                .keys()
                .filter(|func| self.native_func_denied(name, func))
                .collect();
            if denied_funcs.is_empty() {
                out.insert(name.clone(), spec.clone());
                continue;
            }
            let mut pruned = (**spec).clone();
            for func in denied_funcs {
                debug!("skipping denylisted native function {name}/{func}");
                pruned.native_funcs.remove(func);
            }
            out.insert(name.clone(), Arc::new(pruned));
        }
        out
    }

    fn native_func_denied(&self, test: &str, func: &str) -> bool {
        self.deny.iter().any(|p| {
            let Some((test_pattern, func_pattern)) = p.as_str().split_once('/') else {
                return false;
            };
            let (Ok(test_pattern), Ok(func_pattern)) =
                (NamePattern::new(test_pattern), NamePattern::new(func_pattern))
            else {
                return false;
            };
            test_pattern.is_match(test) && func_pattern.is_match(func)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NativeFunc, TestBody, TestSpec};
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    const RULES: &str = indoc! {r#"
        - pattern: skip-console-warnings
          platforms:
            - azure
        - pattern: basic*
          tracker: https://example.com/issues/1
        - pattern: snoozed
          snooze: 2030-01-01
        - pattern: expired
          snooze: 2020-01-01
        - pattern: expired-warn
          snooze: 2020-01-01
          warn: true
        - pattern: flaky
          warn: true
        - pattern: other-arch
          arches:
            - s390x
        - pattern: other-stream
          streams:
            - rawhide
        - pattern: versioned
          osversion:
            - rhel-9.6
    "#};

    fn ctx() -> DenyContext {
        DenyContext {
            arch: "x86_64".to_owned(),
            platform: "qemu".to_owned(),
            stream: Some("stable".to_owned()),
            os_version: None,
            today: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        }
    }

    #[test]
    fn resolve_rules() {
        let rules = Denylist::parse_rules(RULES).unwrap();
        assert_eq!(rules.len(), 9);
        assert_eq!(rules[1].tracker.as_deref(), Some("https://example.com/issues/1"));

        let denylist = Denylist::resolve(&rules, &ctx()).unwrap();
        assert!(!denylist.skip_console_warnings());
        assert!(denylist.is_denylisted("basic"));
        assert!(denylist.is_denylisted("basic.nvme"));
        assert!(denylist.is_denylisted("snoozed"));
        assert!(!denylist.is_denylisted("expired"));
        assert!(!denylist.is_warn_on_failure("expired"));
        assert!(denylist.is_warn_on_failure("expired-warn"));
        assert!(denylist.is_warn_on_failure("flaky"));
        assert!(!denylist.is_denylisted("flaky"));
        assert!(!denylist.is_denylisted("other-arch"));
        assert!(!denylist.is_denylisted("other-stream"));
        // The OS version is unknown, so the rule isn't scoped away.
        assert!(denylist.is_denylisted("versioned"));
    }

    #[test]
    fn console_warnings_sentinel() {
        let rules = Denylist::parse_rules(RULES).unwrap();
        let mut azure = ctx();
        azure.platform = "azure".to_owned();
        assert!(Denylist::resolve(&rules, &azure).unwrap().skip_console_warnings());
    }

    #[test]
    fn snooze_expires_on_its_date() {
        let rules = vec![DenyRule {
            pattern: "t".to_owned(),
            snooze: Some("2026-10-19".to_owned()),
            ..Default::default()
        }];
        let mut before = ctx();
        before.today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert!(Denylist::resolve(&rules, &before).unwrap().is_denylisted("t"));
        assert!(!Denylist::resolve(&rules, &ctx()).unwrap().is_denylisted("t"));
    }

    #[test]
    fn invalid_snooze() {
        let rules = vec![DenyRule {
            pattern: "t".to_owned(),
            snooze: Some("19/10/2026".to_owned()),
            ..Default::default()
        }];
        let err = Denylist::resolve(&rules, &ctx()).unwrap_err();
        assert!(matches!(err, DenylistParseError::Snooze { .. }), "{err}");
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = Utf8TempDir::new().unwrap();
        let denylist = Denylist::from_path(&dir.path().join("nope.yaml"), &ctx()).unwrap();
        assert!(!denylist.is_denylisted("anything"));

        let path = dir.path().join("denylist.yaml");
        std::fs::write(&path, "- pattern: [unclosed").unwrap();
        Denylist::from_path(&path, &ctx()).unwrap_err();
    }

    #[test]
    fn filter_tests_and_native_funcs() {
        let mut basic = TestSpec::new("basic", TestBody::new(|_| async { Ok(()) }));
        basic.native_funcs = btreemap! {
            "NetworkScripts".to_owned() => NativeFunc::default(),
            "ServiceUnits".to_owned() => NativeFunc::default(),
        };
        let mut other = basic.clone();
        other.name = "other".to_owned();
        let tests: RunnableSet = [basic, other, TestSpec::new("gone", TestBody::new(|_| async { Ok(()) }))]
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();

        let mut denylist = Denylist::new();
        denylist.add_deny_pattern("gone").unwrap();
        denylist.add_deny_pattern("basic/Network*").unwrap();
        let filtered = denylist.filter(&tests);

        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["basic", "other"]);
        assert_eq!(
            filtered["basic"].native_funcs.keys().collect::<Vec<_>>(),
            vec!["ServiceUnits"]
        );
        assert_eq!(filtered["other"].native_funcs.len(), 2);
    }
}
