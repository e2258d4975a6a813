// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The run pipeline.
//!
//! A run selects tests from a bank, drops denied ones, packs non-exclusive tests into buckets,
//! multiplies and shards the result, and then executes it as a [`Suite`]. Each test gets its own
//! cluster from the [`Flight`]. Failures that look like flakes may then be run once more.

use crate::{
    bucket::{BucketOptions, MemberRunner, bucket_tests},
    config::{Parallelism, RunSettings},
    conf::{Config, WarningsAction},
    console::ConsoleClassifier,
    denylist::Denylist,
    errors::{ProvisionError, RunError},
    external::{collect_logs, install_dependency_dir, install_executable},
    harness::{
        H, Suite, SuiteOptions, SuiteSummary, SuiteTest, TAP_FILE_NAME, TestAbort, TestResult,
        TimerStart,
    },
    partition::Sharding,
    platform::{Cluster, Flight, Machine, MachineOptions, RuntimeConfig, TestCluster},
    registry::{
        Flag, NEEDS_INTERNET_TAG, RunnableSet, SKIP_BASE_CHECKS_TAG, TestFuture, TestSpec,
        multiply,
    },
    reporter::{JsonReporter, JunitReporter, Reporters},
    rerun::{
        RerunMarks, all_allow_rerun_success, reconcile, rerun_candidates, warn_failed_tests,
    },
    test_filter::TestFilterBuilder,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use futures::FutureExt;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Name of the subdirectory of the output directory that holds the rerun's output.
pub const RERUN_DIR_NAME: &str = "rerun";

/// Log target for messages printed without a heading.
pub const NO_HEADING_TARGET: &str = "sortie::no_heading";

/// The overall result of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunVerdict {
    /// Every test passed.
    Pass,
    /// At least one test failed.
    Fail,
    /// The only failures were in warn-on-failure tests.
    Warn,
    /// Every selected test was denied, or sharded away.
    NoTestsRun,
}

impl RunVerdict {
    /// Returns true if the run counts as successful.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Pass | Self::NoTestsRun)
    }

    /// The verdict as printed in the run summary.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Warn => "WARN",
            Self::NoTestsRun => "NO TESTS RUN",
        }
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of [`TestRunner::run`].
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// The final verdict, after any rerun.
    pub verdict: RunVerdict,
    /// Number of failed tests counted against the run.
    pub failed: usize,
    /// Where the run's artifacts are.
    pub output_dir: Utf8PathBuf,
    /// Whether a rerun happened.
    pub reran: bool,
}

/// Builds a [`TestRunner`].
#[derive(Clone, Debug)]
pub struct TestRunnerBuilder {
    settings: RunSettings,
    patterns: Vec<String>,
    tags: Vec<String>,
    arch: String,
    distro: String,
    no_net: bool,
    force_platform_independent: bool,
    sharding: Option<Sharding>,
    multiply: usize,
    rerun: bool,
    allow_rerun_success: Vec<String>,
    output_dir: Option<Utf8PathBuf>,
    tapfile: Option<Utf8PathBuf>,
    version: String,
}

impl TestRunnerBuilder {
    /// Creates a builder from the `[run]` settings, targeting `arch`.
    pub fn new(settings: RunSettings, arch: impl Into<String>) -> Self {
        Self {
            settings,
            patterns: Vec::new(),
            tags: Vec::new(),
            arch: arch.into(),
            distro: String::new(),
            no_net: false,
            force_platform_independent: false,
            sharding: None,
            multiply: 1,
            rerun: false,
            allow_rerun_success: Vec::new(),
            output_dir: None,
            tapfile: None,
            version: String::new(),
        }
    }

    /// Sets the name patterns to run. An empty list runs everything.
    pub fn set_patterns(
        &mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the tags to select by. Tags starting with `!` exclude tests.
    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the distribution under test.
    pub fn set_distro(&mut self, distro: impl Into<String>) -> &mut Self {
        self.distro = distro.into();
        self
    }

    /// Skips tests that need internet access.
    pub fn set_no_net(&mut self, no_net: bool) -> &mut Self {
        self.no_net = no_net;
        self
    }

    /// Runs platform-independent tests on this platform too.
    pub fn set_force_platform_independent(&mut self, force: bool) -> &mut Self {
        self.force_platform_independent = force;
        self
    }

    /// Runs only one shard of the selected tests.
    pub fn set_sharding(&mut self, sharding: Option<Sharding>) -> &mut Self {
        self.sharding = sharding;
        self
    }

    /// Runs every test `count` times.
    pub fn set_multiply(&mut self, count: usize) -> &mut Self {
        self.multiply = count.max(1);
        self
    }

    /// Reruns flaky-looking failures once.
    pub fn set_rerun(&mut self, rerun: bool) -> &mut Self {
        self.rerun = rerun;
        self
    }

    /// Sets the tags whose tests may pass on rerun. `all` or `*` allows every test.
    pub fn set_allow_rerun_success(
        &mut self,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.allow_rerun_success = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the output directory. By default a new one is created under `output-base-dir`.
    pub fn set_output_dir(&mut self, dir: Option<Utf8PathBuf>) -> &mut Self {
        self.output_dir = dir;
        self
    }

    /// Copies the TAP file to `path` after the run.
    pub fn set_tapfile(&mut self, path: Option<Utf8PathBuf>) -> &mut Self {
        self.tapfile = path;
        self
    }

    /// Records the version of the system under test in the JSON report.
    pub fn set_version(&mut self, version: impl Into<String>) -> &mut Self {
        self.version = version.into();
        self
    }

    /// Overrides the number of tests run in parallel.
    pub fn set_parallel(&mut self, parallel: Parallelism) -> &mut Self {
        self.settings.parallel = parallel;
        self
    }

    /// Overrides the timeout extension.
    pub fn set_extend_timeout_percent(&mut self, percent: u32) -> &mut Self {
        self.settings.extend_timeout_percent = percent;
        self
    }

    /// Creates the runner.
    pub fn build(self, flight: Arc<dyn Flight>, denylist: Denylist) -> TestRunner {
        TestRunner {
            inner: Arc::new(RunnerInner {
                flight,
                denylist,
                classifier: ConsoleClassifier::default(),
                marks: RerunMarks::new(),
                options: self,
            }),
        }
    }
}

/// Runs tests against a [`Flight`].
#[derive(Clone, Debug)]
pub struct TestRunner {
    inner: Arc<RunnerInner>,
}

impl TestRunner {
    /// Runs the tests in `bank` selected by the runner's options, reruns flakes if asked to, and
    /// destroys the flight.
    pub async fn run(&self, bank: &RunnableSet) -> Result<RunOutput, RunError> {
        let res = self.inner.run(bank).await;
        self.inner.flight.destroy().await;
        res
    }

    /// Tests marked during this run as allowed to pass on rerun.
    pub fn rerun_marks(&self) -> &RerunMarks {
        &self.inner.marks
    }
}

struct RunnerInner {
    flight: Arc<dyn Flight>,
    denylist: Denylist,
    classifier: ConsoleClassifier,
    marks: RerunMarks,
    options: TestRunnerBuilder,
}

struct Pass {
    verdict: RunVerdict,
    summary: Option<SuiteSummary>,
}

impl RunnerInner {
    async fn run(self: &Arc<Self>, bank: &RunnableSet) -> Result<RunOutput, RunError> {
        let output_dir = self.output_dir()?;
        let first = self
            .run_once(
                bank,
                &self.options.patterns,
                self.options.multiply,
                self.options.sharding.as_ref(),
                &output_dir,
            )
            .await?;
        if let Some(tapfile) = &self.options.tapfile {
            std::fs::copy(output_dir.join(TAP_FILE_NAME), tapfile).map_err(|err| {
                RunError::CopyTap {
                    path: tapfile.clone(),
                    err,
                }
            })?;
        }

        let outcomes = first.summary.as_ref().map_or(&[][..], |s| &s.outcomes[..]);
        let warn_failed = warn_failed_tests(outcomes, &self.denylist);
        for name in &warn_failed {
            info!("test {name} failed, but only warns on failure");
        }
        let candidates = rerun_candidates(bank, outcomes, &self.denylist);

        let mut rerun = None;
        if self.options.rerun && !candidates.is_empty() {
            info!(
                target: NO_HEADING_TARGET,
                "\n======== Re-running failed tests (flake detection) ========\n"
            );
            // Candidates were sharded in the first run, possibly under a bucket wrapper's name.
            let patterns: Vec<String> = candidates.keys().cloned().collect();
            let second = self
                .run_once(&candidates, &patterns, 1, None, &output_dir.join(RERUN_DIR_NAME))
                .await?;
            rerun = Some(second.verdict);
        }

        let allowed =
            all_allow_rerun_success(&candidates, &self.options.allow_rerun_success, &self.marks);
        let reconciled = reconcile(
            first.verdict,
            candidates.len(),
            rerun,
            allowed,
            !warn_failed.is_empty(),
        );
        if rerun.is_some() && reconciled.verdict != first.verdict {
            info!(
                "verdict after rerun: {} ({} failed)",
                reconciled.verdict, reconciled.failed
            );
        }
        Ok(RunOutput {
            verdict: reconciled.verdict,
            failed: reconciled.failed,
            output_dir,
            reran: rerun.is_some(),
        })
    }

    async fn run_once(
        self: &Arc<Self>,
        bank: &RunnableSet,
        patterns: &[String],
        multiply_count: usize,
        sharding: Option<&Sharding>,
        output_dir: &Utf8Path,
    ) -> Result<Pass, RunError> {
        let options = &self.options;
        let settings = &options.settings;

        let mut builder = TestFilterBuilder::new(patterns, self.flight.platform(), &options.arch)?;
        builder
            .set_tags(&options.tags)
            .set_distro(&options.distro)
            .set_no_net(options.no_net)
            .set_force_platform_independent(options.force_platform_independent)
            .set_platform_independent_platform(&settings.platform_independent_platform);
        let filter = builder.build();
        if !bank.is_empty() {
            filter.check_patterns(bank)?;
        }

        let tests = filter.filter(bank);
        if tests.is_empty() {
            return Err(RunError::NoMatchingTests);
        }
        let tests = self.denylist.filter(&tests);
        if tests.is_empty() {
            info!("all selected tests are denylisted");
            return Ok(Pass {
                verdict: RunVerdict::NoTestsRun,
                summary: None,
            });
        }

        let flight = self.flight.clone();
        let too_large = move |config: &Config| flight.config_too_large(config);
        let runner: MemberRunner = {
            let inner = self.clone();
            Arc::new(move |tc: TestCluster, spec: Arc<TestSpec>| -> TestFuture {
                let inner = inner.clone();
                async move { inner.run_member(tc, spec).await }.boxed()
            })
        };
        let tests = bucket_tests(
            tests,
            &BucketOptions {
                too_large: &too_large,
                member_default_timeout: settings.bucket_member_default_timeout,
                runner,
            },
        )?;
        let mut tests = multiply(tests, multiply_count);
        if let Some(sharding) = sharding {
            tests = sharding.select(tests);
            debug!("shard {sharding}: {} tests selected", tests.len());
        }

        let mut reporters = Reporters::new();
        reporters.push(Arc::new(JsonReporter::new(
            self.flight.platform(),
            options.version.as_str(),
        )));
        reporters.push(Arc::new(JunitReporter::new("sortie")));
        let mut suite = Suite::new(SuiteOptions {
            output_dir: output_dir.to_owned(),
            parallel: settings.parallel.compute(),
            timeout_grace: settings.timeout_abandon_grace,
            reporters,
        });
        for spec in tests.into_values() {
            let timeout = scale_timeout(
                spec.timeout.unwrap_or(settings.default_timeout),
                settings.extend_timeout_percent,
            );
            let inner = self.clone();
            let test = SuiteTest::new(spec.name.clone(), move |h| async move {
                inner.run_test(h, spec).await
            });
            suite.add_test(test.with_timeout(Some(timeout), TimerStart::Deferred));
        }

        let summary = suite.run().await?;
        let verdict = if !summary.ran {
            RunVerdict::NoTestsRun
        } else if summary.failed {
            RunVerdict::Fail
        } else {
            RunVerdict::Pass
        };
        let status = if summary.failed { "FAIL" } else { "PASS" };
        info!(target: NO_HEADING_TARGET, "{status}, output in {output_dir}");
        Ok(Pass {
            verdict,
            summary: Some(summary),
        })
    }

    async fn run_test(&self, h: H, spec: Arc<TestSpec>) -> TestResult {
        h.set_subtests(spec.subtests.clone());
        if self.denylist.is_warn_on_failure(&spec.name) {
            h.warning_on_failure();
        }
        let output_dir = match h.output_dir() {
            Ok(dir) => dir,
            Err(err) => return Err(h.fatal(format_args!("creating output directory: {err}"))),
        };
        let rconf = RuntimeConfig {
            output_dir,
            internet_access: spec.has_tag(NEEDS_INTERNET_TAG),
            no_instance_creds: spec.has_flag(Flag::NoInstanceCreds),
            no_ssh_key_in_metadata: spec.has_flag(Flag::NoSshKeyInMetadata),
            no_ssh_key_in_user_data: spec.has_flag(Flag::NoSshKeyInUserData),
            warnings_action: warnings_action(&spec),
        };
        let cluster = match self.flight.new_cluster(rconf).await {
            Ok(cluster) => cluster,
            Err(err) => return Err(h.fatal(format_args!("Cluster failed: {err}"))),
        };

        let result = self.run_on_cluster(&h, &cluster, &spec).await;

        h.stop_exec_timer();
        cluster.destroy().await;
        if h.timed_out() {
            self.marks.mark(&spec, "Test timed out.");
        }
        if spec.has_tag(SKIP_BASE_CHECKS_TAG) {
            debug!("skipping base checks for {}", spec.name);
            return result;
        }
        self.check_console(&h, cluster.as_ref(), &spec);
        result
    }

    async fn run_on_cluster(
        &self,
        h: &H,
        cluster: &Arc<dyn Cluster>,
        spec: &Arc<TestSpec>,
    ) -> TestResult {
        if spec.cluster_size > 0 {
            let config = spec
                .user_data
                .render(warnings_action(spec))
                .map_err(|err| h.fatal(format_args!("rendering user data: {err}")))?;
            let options = MachineOptions {
                skip_start_machine: true,
            };
            for _ in 0..spec.cluster_size {
                if let Err(err) = self.new_machine(cluster.as_ref(), &config, options).await {
                    self.marks.mark(spec, "Platform failed starting machines.");
                    return Err(h.fatal(format_args!("Cluster failed starting machines: {err}")));
                }
            }
        }

        let native_funcs = spec.native_funcs.keys().cloned().collect();
        let tc = TestCluster::new(h.clone(), cluster.clone(), native_funcs, spec.fail_fast);

        h.start_exec_timer();
        for machine in tc.machines() {
            let id = machine.id().to_owned();
            let msg = format!("SSH unsuccessful within allotted timeframe for {id}.");
            if let Err(err) = h.run_with_exec_timeout_check(machine.start(), &msg).await? {
                return Err(h.fatal(format_args!("machine {id} failed to start: {err}")));
            }
        }

        self.run_body(tc, spec, true).await
    }

    async fn new_machine(
        &self,
        cluster: &dyn Cluster,
        config: &Config,
        options: MachineOptions,
    ) -> Result<Arc<dyn Machine>, ProvisionError> {
        let settings = &self.options.settings;
        let attempts = settings.provision_attempts.max(1);
        let mut attempt = 1;
        loop {
            match cluster.new_machine(config, options).await {
                Ok(machine) => return Ok(machine),
                Err(err) if attempt < attempts => {
                    warn!("retryloop: failed to bring up machines: {err}");
                    tokio::time::sleep(settings.provision_retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_member(&self, tc: TestCluster, spec: Arc<TestSpec>) -> TestResult {
        let h = tc.h().clone();
        if self.denylist.is_warn_on_failure(&spec.name) {
            h.warning_on_failure();
        }
        let result = self.run_body(tc, &spec, false).await;
        if h.timed_out() {
            self.marks.mark(&spec, "Test timed out.");
        }
        result
    }

    /// Installs a test's files, runs its body, and collects its logs.
    ///
    /// The body is dropped once the node's execution context is cancelled.
    async fn run_body(&self, tc: TestCluster, spec: &TestSpec, exclusive: bool) -> TestResult {
        install_executable(&tc, spec).await?;
        if let Some(dir) = &spec.dependency_dir {
            install_dependency_dir(&tc, dir).await?;
        }

        let token = tc.h().cancellation_token().clone();
        let result = tokio::select! {
            res = spec.run.call(tc.clone()) => res,
            () = token.cancelled() => Err(TestAbort::Failed),
        };
        if token.is_cancelled() {
            return result;
        }

        if exclusive {
            tokio::time::sleep(self.options.settings.journal_flush_grace).await;
        }
        if spec.external_test.is_some() {
            match tc.h().output_dir() {
                Ok(dir) => collect_logs(&tc, spec, &dir).await?,
                Err(err) => tc
                    .h()
                    .error(format_args!("creating output directory: {err}")),
            }
        }
        result
    }

    fn check_console(&self, h: &H, cluster: &dyn Cluster, spec: &TestSpec) {
        let skip_warnings = self.denylist.skip_console_warnings();
        for (kind, outputs) in [
            ("console", cluster.console_output()),
            ("journal", cluster.journal_output()),
        ] {
            for (id, text) in outputs {
                let check = self.classifier.classify(&text, Some(spec));
                if check.findings.is_empty() {
                    continue;
                }
                if check.allow_rerun_success {
                    self.marks.mark(spec, "CheckConsole:");
                }
                for finding in &check.findings {
                    if check.warn_only || skip_warnings {
                        warn!("Found {finding} on machine {id} {kind}");
                    } else {
                        h.error(format_args!("Found {finding} on machine {id} {kind}"));
                    }
                }
            }
        }
    }

    fn output_dir(&self) -> Result<Utf8PathBuf, RunError> {
        if let Some(dir) = &self.options.output_dir {
            return Ok(dir.clone());
        }
        let base = &self.options.settings.output_base_dir;
        let platform = self.flight.platform();
        let now = chrono::Local::now().naive_local();
        let dir = default_output_dir(base, platform, now, std::process::id());
        std::fs::create_dir_all(base).map_err(|err| RunError::OutputDir {
            path: base.clone(),
            err,
        })?;
        refresh_latest_symlink(base, platform, &dir).map_err(|err| RunError::OutputDir {
            path: base.join(format!("{platform}-latest")),
            err,
        })?;
        Ok(dir)
    }
}

impl fmt::Debug for RunnerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerInner")
            .field("flight", &self.flight)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn warnings_action(spec: &TestSpec) -> WarningsAction {
    if spec.has_flag(Flag::AllowConfigWarnings) {
        WarningsAction::Ignore
    } else {
        WarningsAction::Fail
    }
}

/// Extends `timeout` by `percent` percent, saturating at [`Duration::MAX`].
pub fn scale_timeout(timeout: Duration, percent: u32) -> Duration {
    let factor = 100 + u64::from(percent);
    let nanos = timeout.as_nanos().saturating_mul(u128::from(factor)) / 100;
    u64::try_from(nanos).map_or(Duration::MAX, Duration::from_nanos)
}

/// Returns the default output directory for a run on `platform` started at `now`.
pub fn default_output_dir(
    base: &Utf8Path,
    platform: &str,
    now: NaiveDateTime,
    pid: u32,
) -> Utf8PathBuf {
    base.join(format!("{platform}-{}-{pid}", now.format("%Y-%m-%d-%H%M")))
}

/// Points `<base>/<platform>-latest` at `dir`.
///
/// Anything other than a symlink at that path is left alone.
pub fn refresh_latest_symlink(
    base: &Utf8Path,
    platform: &str,
    dir: &Utf8Path,
) -> std::io::Result<()> {
    let link = base.join(format!("{platform}-latest"));
    match std::fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::remove_file(&link)?,
        Ok(_) => {
            warn!("{link} is not a symlink, not updating it");
            return Ok(());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let target = dir.file_name().unwrap_or(dir.as_str());
    symlink(target, &link)
}

#[cfg(unix)]
fn symlink(target: &str, link: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &str, _link: &Utf8Path) -> std::io::Result<()> {
    Ok(())
}
