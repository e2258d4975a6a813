// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classification of console and journal text collected from machines after a test.

use crate::registry::{Flag, TestSpec};
use regex::Regex;
use std::sync::LazyLock;

/// A known-bad pattern in machine output.
#[derive(Clone, Debug)]
pub struct ConsoleRule {
    /// Short description reported when the rule matches.
    pub description: &'static str,
    /// Pattern applied to the whole text.
    pub regex: Regex,
    /// A match only warns instead of failing the test.
    pub warn_only: bool,
    /// A match doesn't prevent a later rerun success from counting.
    pub allow_rerun_success: bool,
    /// Tests with this flag are not checked against the rule.
    pub skip_flag: Option<Flag>,
}

impl ConsoleRule {
    fn new(description: &'static str, pattern: &str) -> Self {
        Self {
            description,
            regex: Regex::new(pattern).expect("built-in console pattern is valid"),
            warn_only: false,
            allow_rerun_success: false,
            skip_flag: None,
        }
    }
}

static DEFAULT_RULES: LazyLock<Vec<ConsoleRule>> = LazyLock::new(|| {
    vec![
        ConsoleRule {
            skip_flag: Some(Flag::NoEmergencyShellCheck),
            ..ConsoleRule::new(
                "emergency shell",
                "Press Enter for emergency shell|Starting Emergency Shell|You are in emergency mode",
            )
        },
        ConsoleRule::new("dracut fatal", "dracut: Refusing to continue"),
        ConsoleRule::new("kernel panic", "Kernel panic - not syncing: (.*)"),
        ConsoleRule::new("kernel oops", "Oops:"),
        // Usually a sign of starved CI resources rather than a bug in the build.
        ConsoleRule {
            warn_only: true,
            allow_rerun_success: true,
            ..ConsoleRule::new("kernel soft lockup", "watchdog: BUG: soft lockup - CPU")
        },
        ConsoleRule::new("kernel warning", r"WARNING: CPU: \d+ PID: \d+ at (.+)"),
        ConsoleRule::new("failure of disk under I/O", "rejecting I/O to offline device"),
        ConsoleRule::new(
            "excessive bonding link status messages",
            "(?s:link status up for interface [^,]+, enabling it in [0-9]+ ms.*?){10}",
        ),
        ConsoleRule::new(
            "ext4 delayed allocation failure",
            r"EXT4-fs \([^)]+\): Delayed block allocation failed for inode \d+ at logical offset \d+ with max blocks \d+ with (error \d+)",
        ),
        ConsoleRule::new("GRUB memory corruption", "((alloc|free) magic) (is )?broken"),
        ConsoleRule::new(
            "Ignition fetch cancellation race",
            r"ignition\[[0-9]+\]: failed to fetch config: context canceled",
        ),
        ConsoleRule::new(
            "initrd-cleanup.service terminated",
            r"initrd-cleanup\.service: Main process exited, code=killed, status=15/TERM",
        ),
        ConsoleRule::new("Go panic", "panic: (.*)"),
        ConsoleRule::new("segfault", "SIGSEGV|=11/SEGV"),
        ConsoleRule::new("core dump", "[Cc]ore dump"),
        ConsoleRule::new("systemd ordering cycle", "Ordering cycle found"),
        ConsoleRule::new("oom killer", "invoked oom-killer"),
        ConsoleRule::new(
            "systemd generator failure",
            "(/.*/system-generators/.*) (failed with exit status|terminated by signal|failed due to unknown reason)",
        ),
    ]
});

/// The findings for one piece of text.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConsoleCheck {
    /// True if every finding is warn-only. Also true if there are no findings.
    pub warn_only: bool,
    /// One line per matching rule: its description, plus the first capture group if any.
    pub findings: Vec<String>,
    /// True if there are findings and every one of them allows a rerun success.
    pub allow_rerun_success: bool,
}

/// Applies an ordered list of rules to machine output.
#[derive(Clone, Debug)]
pub struct ConsoleClassifier {
    rules: Vec<ConsoleRule>,
}

impl Default for ConsoleClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.clone())
    }
}

impl ConsoleClassifier {
    /// Creates a classifier with custom rules.
    pub fn new(rules: Vec<ConsoleRule>) -> Self {
        Self { rules }
    }

    /// The rules, in the order they are applied.
    pub fn rules(&self) -> &[ConsoleRule] {
        &self.rules
    }

    /// Classifies `text`. Rules skipped by one of `test`'s flags are not applied.
    pub fn classify(&self, text: &str, test: Option<&TestSpec>) -> ConsoleCheck {
        let mut check = ConsoleCheck {
            warn_only: true,
            findings: Vec::new(),
            allow_rerun_success: true,
        };
        for rule in &self.rules {
            if let (Some(flag), Some(test)) = (rule.skip_flag, test) {
                if test.has_flag(flag) {
                    continue;
                }
            }
            let Some(caps) = rule.regex.captures(text) else {
                continue;
            };
            let finding = if caps.len() > 1 {
                let group = caps.get(1).map_or("", |m| m.as_str());
                format!("{} ({group})", rule.description)
            } else {
                rule.description.to_owned()
            };
            check.findings.push(finding);
            check.warn_only &= rule.warn_only;
            check.allow_rerun_success &= rule.allow_rerun_success;
        }
        check.allow_rerun_success &= !check.findings.is_empty();
        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TestBody;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn default_table_order() {
        let classifier = ConsoleClassifier::default();
        let descriptions: Vec<_> = classifier.rules().iter().map(|r| r.description).collect();
        assert_eq!(descriptions.len(), 18);
        assert_eq!(descriptions[0], "emergency shell");
        assert_eq!(descriptions[17], "systemd generator failure");
    }

    #[test_case("", &[], true; "clean")]
    #[test_case("Kernel panic - not syncing: VFS: Unable to mount root", &["kernel panic (VFS: Unable to mount root)"], false; "panic with group")]
    #[test_case("watchdog: BUG: soft lockup - CPU#0 stuck", &["kernel soft lockup"], true; "warn only")]
    #[test_case("grub: free magic is broken at 0x1234", &["GRUB memory corruption (free magic)"], false; "grub")]
    #[test_case("systemd-coredump: Process 12 dumped core dump", &["core dump"], false; "core dump")]
    fn classify(text: &str, expected: &[&str], warn_only: bool) {
        let check = ConsoleClassifier::default().classify(text, None);
        assert_eq!(check.findings, expected);
        assert_eq!(check.warn_only, warn_only);
    }

    #[test]
    fn multiple_findings_and_rerun_eligibility() {
        let text = indoc! {"
            watchdog: BUG: soft lockup - CPU#1 stuck for 22s
            [  12.3] Oops: 0000 [#1] SMP
        "};
        let check = ConsoleClassifier::default().classify(text, None);
        assert_eq!(check.findings, vec!["kernel oops", "kernel soft lockup"]);
        assert!(!check.warn_only);
        assert!(!check.allow_rerun_success);

        let check = ConsoleClassifier::default()
            .classify("watchdog: BUG: soft lockup - CPU#1 stuck for 22s", None);
        assert!(check.warn_only);
        assert!(check.allow_rerun_success);
    }

    #[test]
    fn skip_flag_disables_rule() {
        let text = "You are in emergency mode.";
        let mut spec = TestSpec::new("t", TestBody::new(|_| async { Ok(()) }));
        let classifier = ConsoleClassifier::default();
        assert_eq!(
            classifier.classify(text, Some(&spec)).findings,
            vec!["emergency shell"]
        );
        spec.flags.push(Flag::NoEmergencyShellCheck);
        assert!(classifier.classify(text, Some(&spec)).findings.is_empty());
    }

    #[test]
    fn bonding_needs_ten_occurrences() {
        let line = "bond0: link status up for interface eth0, enabling it in 200 ms\n";
        let classifier = ConsoleClassifier::default();
        assert!(classifier.classify(&line.repeat(9), None).findings.is_empty());
        assert_eq!(
            classifier.classify(&line.repeat(10), None).findings,
            vec!["excessive bonding link status messages"]
        );
    }
}
