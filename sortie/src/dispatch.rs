// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    builtin,
    errors::Result,
    local::LocalFlight,
    output::{OutputContext, OutputOpts, Styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use owo_colors::OwoColorize;
use serde::Serialize;
use sortie_metadata::SortieExitCode;
use sortie_runner::{
    config::{DenylistSettings, Parallelism, SortieConfig},
    denylist::{DenyContext, Denylist, ManifestVariables},
    external::ExternalTestLoader,
    partition::Sharding,
    platform::Flight,
    registry::{Registries, RunnableSet, TestSpec},
    reporter::read_report,
    rerun::rerunnable_test_name,
    run::{RunVerdict, TestRunnerBuilder},
    test_filter::is_allowed,
};
use std::{io::Write, sync::Arc};
use tracing::info;

/// Provision disposable machines, run integration tests against them, and triage the results.
///
/// Machines come from a local flight: each one is a scratch directory under the run's output
/// directory, and commands sent to it run on this host.
#[derive(Debug, Parser)]
#[command(version, styles = crate::output::clap_styles::style(), max_term_width = 100)]
pub struct SortieApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Command,
}

impl SortieApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        match self.command {
            Command::List {
                json,
                platform_filter,
                distro_filter,
            } => {
                let registries = builtin::registries()?;
                let filter = ListFilter {
                    platform: &platform_filter,
                    distro: &distro_filter,
                };
                let mut stdout = std::io::stdout().lock();
                if json {
                    write_list_json(&registries, &filter, &mut stdout)?;
                } else {
                    write_list(&registries, &filter, &output.stdout_styles(), &mut stdout)?;
                }
                stdout
                    .flush()
                    .map_err(|err| ExpectedError::WriteOutputError { err })?;
                Ok(SortieExitCode::OK)
            }
            Command::Run { patterns, run_opts } => {
                let app = BaseApp::new(self.common)?;
                let registries = app.registries(&run_opts.exttests)?;
                let mut builder = app.runner_builder(patterns, &run_opts.rerun_opts)?;
                builder.set_multiply(run_opts.multiply);
                app.exec_run(builder, &registries.tests.to_runnable_set())
            }
            Command::RunUpgrade {
                patterns,
                rerun_opts,
            } => {
                let app = BaseApp::new(self.common)?;
                let registries = app.registries(&[])?;
                let builder = app.runner_builder(patterns, &rerun_opts)?;
                app.exec_run(builder, &registries.upgrade_tests.to_runnable_set())
            }
            Command::Rerun { from, run_opts } => {
                let app = BaseApp::new(self.common)?;
                let report = read_report(&from)?;
                let patterns = failed_patterns(
                    report.failed_tests().map(|t| t.name.as_str()),
                    &app.denylist,
                );
                if patterns.is_empty() {
                    info!("no rerunnable failed tests in {from}");
                    return Ok(SortieExitCode::NO_TESTS_RUN);
                }
                info!("rerunning {} failed tests from {from}", patterns.len());

                let registries = app.registries(&run_opts.exttests)?;
                let mut builder = app.runner_builder(patterns, &run_opts.rerun_opts)?;
                builder.set_multiply(run_opts.multiply);
                app.exec_run(builder, &registries.tests.to_runnable_set())
            }
        }
    }
}

#[derive(Debug, Args)]
struct CommonOpts {
    /// Platform to run tests on
    #[arg(long, short = 'p', global = true, default_value = "qemu", value_name = "PLATFORM")]
    platform: String,

    /// Architecture of the machines under test [default: host architecture]
    #[arg(long, global = true, value_name = "ARCH")]
    arch: Option<String>,

    /// Distribution under test
    #[arg(long, short = 'b', global = true, value_name = "DISTRO")]
    distro: Option<String>,

    /// Number of tests to run at once: a number, or "num-cpus"
    #[arg(long, short = 'j', global = true, value_name = "N", env = "SORTIE_PARALLEL")]
    parallel: Option<Parallelism>,

    /// Output directory [default: <output-base-dir>/<platform>-<timestamp>-<pid>]
    #[arg(long, global = true, value_name = "DIR")]
    output_dir: Option<Utf8PathBuf>,

    /// Copy the TAP file here after the run
    #[arg(long, global = true, value_name = "PATH")]
    tapfile: Option<Utf8PathBuf>,

    /// Exit successfully even if tests failed
    #[arg(long, short = 'T', global = true)]
    no_test_exit_error: bool,

    /// Deny tests matching this pattern, or native functions with `test/func`
    #[arg(long, global = true, value_name = "PATTERN")]
    denylist_test: Vec<String>,

    /// Select tests with this tag; `!tag` excludes tests with it
    #[arg(long, global = true, value_name = "TAG")]
    tag: Vec<String>,

    /// Skip tests that need internet access
    #[arg(long, global = true)]
    no_net: bool,

    /// Run one shard of the tests, as hash:M/N
    #[arg(long, global = true, value_name = "SPEC")]
    sharding: Option<String>,

    /// Extend every timeout by this percentage
    #[arg(long, global = true, value_name = "PERCENT")]
    extend_timeout_percent: Option<u32>,

    /// Run platform-independent tests on this platform
    #[arg(long, global = true)]
    force_platform_independent: bool,

    /// Config file [default: .config/sortie.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run tests
    ///
    /// Patterns are globs matched against test names. With no patterns, every test that applies
    /// to the platform, architecture and distribution runs.
    Run {
        /// Test name patterns
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,

        #[command(flatten)]
        run_opts: RunOpts,
    },
    /// Run upgrade tests
    RunUpgrade {
        /// Test name patterns
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,

        #[command(flatten)]
        rerun_opts: RerunOpts,
    },
    /// List registered tests
    List {
        /// Print the list as JSON
        #[arg(long)]
        json: bool,

        /// Only list tests that run on this platform
        #[arg(long, default_value = "all", value_name = "PLATFORM")]
        platform_filter: String,

        /// Only list tests that run on this distribution
        #[arg(long, default_value = "all", value_name = "DISTRO")]
        distro_filter: String,
    },
    /// Run the tests that failed in a previous run
    Rerun {
        /// Output directory of the previous run
        #[arg(long, value_name = "DIR")]
        from: Utf8PathBuf,

        #[command(flatten)]
        run_opts: RunOpts,
    },
}

#[derive(Debug, Args)]
#[command(next_help_heading = "RUN OPTIONS")]
struct RunOpts {
    /// Register external tests from DIR/tests/kola
    #[arg(long = "exttest", short = 'E', value_name = "DIR")]
    exttests: Vec<Utf8PathBuf>,

    /// Run every test N times
    #[arg(long, default_value_t = 1, value_name = "N")]
    multiply: usize,

    #[command(flatten)]
    rerun_opts: RerunOpts,
}

#[derive(Debug, Args)]
struct RerunOpts {
    /// Rerun failed tests once to detect flakes
    #[arg(long)]
    rerun: bool,

    /// Tags of tests allowed to pass on rerun; `all` allows every test
    #[arg(long, value_name = "TAG")]
    allow_rerun_success: Vec<String>,
}

/// Everything a run needs beyond the selected tests.
struct BaseApp {
    common: CommonOpts,
    config: SortieConfig,
    arch: String,
    denylist: Denylist,
}

impl BaseApp {
    fn new(common: CommonOpts) -> Result<Self> {
        let cwd = current_dir()?;
        let config = SortieConfig::from_sources(&cwd, common.config_file.as_deref())?;
        let arch = common
            .arch
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_owned());
        let ctx = DenyContext {
            arch: arch.clone(),
            platform: common.platform.clone(),
            stream: None,
            os_version: None,
            today: chrono::Local::now().date_naive(),
        };
        let denylist = load_denylist(&cwd, &config.denylist, ctx, &common.denylist_test)?;

        Ok(Self {
            common,
            config,
            arch,
            denylist,
        })
    }

    fn registries(&self, exttests: &[Utf8PathBuf]) -> Result<Registries> {
        let mut registries = builtin::registries()?;
        let mut loader = ExternalTestLoader::new(&self.denylist);
        for dir in exttests {
            let count = loader
                .register_dir(&mut registries.tests, dir)
                .map_err(|err| ExpectedError::external_test(dir.clone(), err))?;
            info!("registered {count} external tests from {dir}");
        }
        Ok(registries)
    }

    fn runner_builder(
        &self,
        patterns: Vec<String>,
        rerun_opts: &RerunOpts,
    ) -> Result<TestRunnerBuilder> {
        let common = &self.common;
        let sharding = common
            .sharding
            .as_deref()
            .map(str::parse::<Sharding>)
            .transpose()?;

        let mut builder = TestRunnerBuilder::new(self.config.run.clone(), &self.arch);
        builder
            .set_patterns(patterns)
            .set_tags(&common.tag)
            .set_distro(common.distro.clone().unwrap_or_default())
            .set_no_net(common.no_net)
            .set_force_platform_independent(common.force_platform_independent)
            .set_sharding(sharding)
            .set_rerun(rerun_opts.rerun)
            .set_allow_rerun_success(&rerun_opts.allow_rerun_success)
            .set_output_dir(common.output_dir.clone())
            .set_tapfile(common.tapfile.clone())
            .set_version(env!("CARGO_PKG_VERSION"));
        if let Some(parallel) = common.parallel {
            builder.set_parallel(parallel);
        }
        if let Some(percent) = common.extend_timeout_percent {
            builder.set_extend_timeout_percent(percent);
        }
        Ok(builder)
    }

    fn exec_run(&self, builder: TestRunnerBuilder, bank: &RunnableSet) -> Result<i32> {
        let flight: Arc<dyn Flight> = Arc::new(LocalFlight::new(&self.common.platform));
        let runner = builder.build(flight, self.denylist.clone());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| ExpectedError::RuntimeCreateError { err })?;
        let output = runtime.block_on(runner.run(bank))?;
        Ok(exit_code(output.verdict, self.common.no_test_exit_error))
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let dir = std::env::current_dir().map_err(|err| ExpectedError::CurrentDirFailed { err })?;
    Utf8PathBuf::try_from(dir).map_err(|err| ExpectedError::CurrentDirInvalidUtf8 {
        path: err.into_path_buf(),
    })
}

fn load_denylist(
    cwd: &Utf8Path,
    settings: &DenylistSettings,
    mut ctx: DenyContext,
    cli_patterns: &[String],
) -> Result<Denylist> {
    if let Some(manifest) = &settings.manifest {
        let variables = ManifestVariables::from_path(&cwd.join(manifest))?;
        ctx.stream = variables.stream;
        ctx.os_version = variables.osversion;
    }
    let mut denylist = match &settings.path {
        Some(path) => Denylist::from_path(&cwd.join(path), &ctx)?,
        None => Denylist::new(),
    };
    for pattern in cli_patterns {
        denylist
            .add_deny_pattern(pattern)
            .map_err(ExpectedError::deny_pattern)?;
    }
    Ok(denylist)
}

/// Maps the verdict of a run to the process exit code.
fn exit_code(verdict: RunVerdict, no_test_exit_error: bool) -> i32 {
    match verdict {
        RunVerdict::Pass => SortieExitCode::OK,
        RunVerdict::NoTestsRun => SortieExitCode::NO_TESTS_RUN,
        RunVerdict::Fail | RunVerdict::Warn if no_test_exit_error => SortieExitCode::OK,
        RunVerdict::Warn => SortieExitCode::TEST_RUN_WARNED,
        RunVerdict::Fail => SortieExitCode::TEST_RUN_FAILED,
    }
}

/// Returns the sorted, deduplicated names of the failed tests that can be rerun.
fn failed_patterns<'a>(
    failed: impl IntoIterator<Item = &'a str>,
    denylist: &Denylist,
) -> Vec<String> {
    failed
        .into_iter()
        .filter_map(|name| rerunnable_test_name(name, denylist))
        .sorted_unstable()
        .dedup()
        .map(str::to_owned)
        .collect()
}

struct ListFilter<'a> {
    platform: &'a str,
    distro: &'a str,
}

impl ListFilter<'_> {
    fn matches(&self, test: &TestSpec) -> bool {
        filter_allows(self.platform, &test.platforms, &test.exclude_platforms)
            && filter_allows(self.distro, &test.distros, &test.exclude_distros)
    }
}

fn filter_allows(filter: &str, include: &[String], exclude: &[String]) -> bool {
    filter == "all" || is_allowed(filter, include, exclude).0
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ListedTest<'a> {
    name: &'a str,
    description: &'a str,
    upgrade: bool,
    platforms: &'a [String],
    exclude_platforms: &'a [String],
    architectures: &'a [String],
    exclude_architectures: &'a [String],
    distros: &'a [String],
    exclude_distros: &'a [String],
    tags: &'a [String],
}

impl<'a> ListedTest<'a> {
    fn new(test: &'a TestSpec, upgrade: bool) -> Self {
        Self {
            name: &test.name,
            description: &test.description,
            upgrade,
            platforms: &test.platforms,
            exclude_platforms: &test.exclude_platforms,
            architectures: &test.architectures,
            exclude_architectures: &test.exclude_architectures,
            distros: &test.distros,
            exclude_distros: &test.exclude_distros,
            tags: &test.tags,
        }
    }
}

fn listed_tests<'a>(registries: &'a Registries, filter: &ListFilter<'_>) -> Vec<ListedTest<'a>> {
    let regular = registries.tests.iter().map(|t| (t, false));
    let upgrade = registries.upgrade_tests.iter().map(|t| (t, true));
    regular
        .chain(upgrade)
        .filter(|(test, _)| filter.matches(test))
        .map(|(test, upgrade)| ListedTest::new(test, upgrade))
        .collect()
}

fn write_list_json(
    registries: &Registries,
    filter: &ListFilter<'_>,
    writer: &mut dyn Write,
) -> Result<()> {
    let tests = listed_tests(registries, filter);
    serde_json::to_writer_pretty(&mut *writer, &tests)
        .map_err(|err| ExpectedError::ListSerializeError { err })?;
    writeln!(writer).map_err(|err| ExpectedError::WriteOutputError { err })
}

fn write_list(
    registries: &Registries,
    filter: &ListFilter<'_>,
    styles: &Styles,
    writer: &mut dyn Write,
) -> Result<()> {
    let write = |writer: &mut dyn Write| -> std::io::Result<()> {
        let header = format!("{:<32} {:<24} {}", "Test Name", "Platforms", "Architectures");
        writeln!(writer, "{}", header.style(styles.bold))?;
        for test in listed_tests(registries, filter) {
            writeln!(
                writer,
                "{:<32} {:<24} {}",
                test.name,
                describe_list(test.platforms, test.exclude_platforms),
                describe_list(test.architectures, test.exclude_architectures),
            )?;
        }
        Ok(())
    };
    write(writer).map_err(|err| ExpectedError::WriteOutputError { err })
}

/// Renders an allow-list and a deny-list, e.g. `[qemu]` or `all except [aws]`.
fn describe_list(include: &[String], exclude: &[String]) -> String {
    let base = if include.is_empty() {
        "all".to_owned()
    } else {
        format!("[{}]", include.join(" "))
    };
    if exclude.is_empty() {
        base
    } else {
        format!("{base} except [{}]", exclude.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sortie_runner::registry::{Registry, TestBody};
    use test_case::test_case;

    fn parse(args: &[&str]) -> SortieApp {
        SortieApp::try_parse_from(std::iter::once("sortie").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn parses_global_options_anywhere() {
        let app = parse(&[
            "run",
            "-p",
            "aws",
            "--tag",
            "!slow",
            "-j",
            "num-cpus",
            "basic*",
            "--rerun",
            "--allow-rerun-success",
            "flaky",
            "-E",
            "/src/tests",
        ]);
        assert_eq!(app.common.platform, "aws");
        assert_eq!(app.common.tag, vec!["!slow"]);
        assert_eq!(app.common.parallel, Some(Parallelism::NumCpus));
        let Command::Run { patterns, run_opts } = app.command else {
            panic!("expected run command");
        };
        assert_eq!(patterns, vec!["basic*"]);
        assert!(run_opts.rerun_opts.rerun);
        assert_eq!(run_opts.rerun_opts.allow_rerun_success, vec!["flaky"]);
        assert_eq!(run_opts.exttests, vec![Utf8PathBuf::from("/src/tests")]);
        assert_eq!(run_opts.multiply, 1);
    }

    #[test]
    fn run_upgrade_has_no_multiply() {
        SortieApp::try_parse_from(["sortie", "run-upgrade", "--multiply", "2"]).unwrap_err();
        let app = parse(&["run-upgrade", "--rerun", "upgrade.*"]);
        assert!(matches!(
            app.command,
            Command::RunUpgrade { ref patterns, ref rerun_opts }
                if patterns == &["upgrade.*"] && rerun_opts.rerun
        ));
    }

    #[test_case(RunVerdict::Pass, false, SortieExitCode::OK ; "pass")]
    #[test_case(RunVerdict::Fail, false, SortieExitCode::TEST_RUN_FAILED ; "fail")]
    #[test_case(RunVerdict::Warn, false, SortieExitCode::TEST_RUN_WARNED ; "warn")]
    #[test_case(RunVerdict::NoTestsRun, false, SortieExitCode::NO_TESTS_RUN ; "no tests")]
    #[test_case(RunVerdict::Fail, true, SortieExitCode::OK ; "fail suppressed")]
    #[test_case(RunVerdict::Warn, true, SortieExitCode::OK ; "warn suppressed")]
    #[test_case(RunVerdict::NoTestsRun, true, SortieExitCode::NO_TESTS_RUN ; "no tests not suppressed")]
    fn exit_codes(verdict: RunVerdict, no_test_exit_error: bool, expected: i32) {
        assert_eq!(exit_code(verdict, no_test_exit_error), expected);
    }

    #[test]
    fn rerun_patterns() {
        let denylist = {
            let ctx = DenyContext {
                arch: "x86_64".to_owned(),
                platform: "qemu".to_owned(),
                stream: None,
                os_version: None,
                today: chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            };
            let rules = Denylist::parse_rules("- pattern: shaky\n  warn: true\n").unwrap();
            Denylist::resolve(&rules, &ctx).unwrap()
        };
        let failed = [
            "basic",
            "basic/uname",
            "non-exclusive-test-bucket-0",
            "non-exclusive-test-bucket-0/non-exclusive.env",
            "shaky",
            "basic",
        ];
        assert_eq!(
            failed_patterns(failed, &denylist),
            vec!["basic", "non-exclusive.env"]
        );
    }

    #[test]
    fn denylist_from_config() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("denylist.yaml"),
            indoc! {"
                - pattern: basic
                  streams: [stable]
                - pattern: cluster.*
                  snooze: 2026-10-01
            "},
        )
        .unwrap();
        std::fs::write(
            dir.path().join("manifest.yaml"),
            "variables:\n  stream: stable\n",
        )
        .unwrap();
        let settings = DenylistSettings {
            path: Some("denylist.yaml".into()),
            manifest: Some("manifest.yaml".into()),
        };
        let ctx = DenyContext {
            arch: "x86_64".to_owned(),
            platform: "qemu".to_owned(),
            stream: None,
            os_version: None,
            today: chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        };

        let denylist = load_denylist(dir.path(), &settings, ctx, &["demo.*".to_owned()]).unwrap();
        assert!(denylist.is_denylisted("basic"));
        assert!(!denylist.is_denylisted("cluster.ping"), "snooze expired");
        assert!(denylist.is_denylisted("demo.sleep"));

        let ctx = DenyContext {
            arch: "x86_64".to_owned(),
            platform: "qemu".to_owned(),
            stream: None,
            os_version: None,
            today: chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        };
        let err = load_denylist(dir.path(), &settings, ctx, &["[".to_owned()]).unwrap_err();
        assert_eq!(err.process_exit_code(), SortieExitCode::INVALID_PATTERN);
    }

    fn listing_registries() -> Registries {
        let mut tests = Registry::new();
        let mut aws_only = TestSpec::new("aws-only", TestBody::new(|_| async { Ok(()) }));
        aws_only.platforms = vec!["aws".to_owned()];
        tests.register(aws_only).unwrap();
        let mut not_arm = TestSpec::new("not-arm", TestBody::new(|_| async { Ok(()) }));
        not_arm.exclude_architectures = vec!["aarch64".to_owned()];
        not_arm.exclude_distros = vec!["rhcos".to_owned()];
        tests.register(not_arm).unwrap();
        Registries {
            tests,
            upgrade_tests: Registry::new(),
        }
    }

    #[test]
    fn list_table() {
        let registries = listing_registries();
        let filter = ListFilter {
            platform: "all",
            distro: "all",
        };
        let mut out = Vec::new();
        write_list(&registries, &filter, &Styles::default(), &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().map(str::trim_end).collect();
        assert_eq!(
            lines,
            vec![
                format!("{:<32} {:<24} {}", "Test Name", "Platforms", "Architectures"),
                format!("{:<32} {:<24} {}", "aws-only", "[aws]", "all"),
                format!("{:<32} {:<24} {}", "not-arm", "all", "all except [aarch64]"),
            ]
        );
    }

    #[test_case("all", "all", &["aws-only", "not-arm"] ; "everything")]
    #[test_case("qemu", "all", &["not-arm"] ; "platform")]
    #[test_case("aws", "rhcos", &["aws-only"] ; "platform and distro")]
    fn list_json(platform: &str, distro: &str, expected: &[&str]) {
        let registries = listing_registries();
        let filter = ListFilter { platform, distro };
        let mut out = Vec::new();
        write_list_json(&registries, &filter, &mut out).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let names: Vec<_> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, expected);
    }
}
