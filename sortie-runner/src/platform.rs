// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the infrastructure tests run on.
//!
//! A [`Flight`] creates [`Cluster`]s, and a cluster creates [`Machine`]s. Remote calls return
//! `'static` futures so that the harness can run them on their own task and walk away from them
//! if a test times out.

use crate::{
    conf::{Config, WarningsAction},
    errors::ProvisionError,
    harness::{H, TestAbort, TestResult},
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Settings for a new cluster.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    /// Directory for the cluster's artifacts.
    pub output_dir: Utf8PathBuf,
    /// Whether machines may reach the internet.
    pub internet_access: bool,
    /// Don't grant machines instance credentials.
    pub no_instance_creds: bool,
    /// Don't inject an SSH key into platform metadata.
    pub no_ssh_key_in_metadata: bool,
    /// Don't inject an SSH key into the user data.
    pub no_ssh_key_in_user_data: bool,
    /// What to do with user data warnings.
    pub warnings_action: WarningsAction,
}

/// Options for a new machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct MachineOptions {
    /// Create the machine without waiting for it to become reachable. The caller starts it with
    /// [`Machine::start`].
    pub skip_start_machine: bool,
}

/// Output of a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SshOutput {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
}

/// A source of clusters on one platform.
pub trait Flight: Send + Sync + fmt::Debug {
    /// The name of the platform, e.g. `qemu`.
    fn platform(&self) -> &str;

    /// Creates a new, empty cluster.
    fn new_cluster(
        &self,
        config: RuntimeConfig,
    ) -> BoxFuture<'static, Result<Arc<dyn Cluster>, ProvisionError>>;

    /// Returns true if the platform can't boot a machine with this config.
    fn config_too_large(&self, config: &Config) -> bool;

    /// Releases any resources shared by the flight's clusters.
    fn destroy(&self) -> BoxFuture<'static, ()>;
}

/// A group of machines created for one test.
pub trait Cluster: Send + Sync {
    /// Creates a machine booting with `config`.
    fn new_machine(
        &self,
        config: &Config,
        options: MachineOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn Machine>, ProvisionError>>;

    /// The cluster's machines, in creation order.
    fn machines(&self) -> Vec<Arc<dyn Machine>>;

    /// Console output of each machine, keyed by machine ID.
    fn console_output(&self) -> BTreeMap<String, String>;

    /// Journal output of each machine, keyed by machine ID.
    fn journal_output(&self) -> BTreeMap<String, String>;

    /// Tears down the cluster and its machines.
    fn destroy(&self) -> BoxFuture<'static, ()>;
}

/// A machine under test.
pub trait Machine: Send + Sync {
    /// The machine's unique ID.
    fn id(&self) -> &str;

    /// Boots the machine and waits until it is reachable.
    fn start(&self) -> BoxFuture<'static, Result<(), ProvisionError>>;

    /// Runs a shell command on the machine.
    fn ssh(&self, cmd: &str) -> BoxFuture<'static, Result<SshOutput, ProvisionError>>;

    /// Copies a local file to `remote` on the machine, making it executable.
    fn install_file(
        &self,
        local: &Utf8Path,
        remote: &str,
    ) -> BoxFuture<'static, Result<(), ProvisionError>>;
}

/// The view of a cluster handed to a test body.
#[derive(Clone)]
pub struct TestCluster {
    h: H,
    cluster: Arc<dyn Cluster>,
    native_funcs: Vec<String>,
    fail_fast: bool,
    has_failure: Arc<AtomicBool>,
}

impl TestCluster {
    /// Creates a new test cluster.
    pub fn new(h: H, cluster: Arc<dyn Cluster>, native_funcs: Vec<String>, fail_fast: bool) -> Self {
        Self {
            h,
            cluster,
            native_funcs,
            fail_fast,
            has_failure: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a test cluster for a subtest node, sharing this cluster's machines.
    pub fn with_h(&self, h: H) -> Self {
        Self {
            h,
            cluster: self.cluster.clone(),
            native_funcs: self.native_funcs.clone(),
            fail_fast: false,
            has_failure: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The node handle of the running test.
    pub fn h(&self) -> &H {
        &self.h
    }

    /// The underlying cluster.
    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// The cluster's machines.
    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.cluster.machines()
    }

    /// Names of the functions this test can dispatch to its machines.
    pub fn native_funcs(&self) -> &[String] {
        &self.native_funcs
    }

    /// Runs `f` as a subtest. With fail-fast set, once one subtest fails every later one is
    /// skipped.
    pub async fn run<F, Fut>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(TestCluster) -> Fut + Send + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        let parent = self.clone();
        if self.fail_fast && self.has_failure.load(Ordering::SeqCst) {
            return self
                .h
                .run(name, |h| async move {
                    Err(h.skip("A previous test has already failed"))
                })
                .await;
        }
        let passed = self
            .h
            .run(name, move |h| f(parent.with_h(h)))
            .await;
        if !passed {
            self.has_failure.store(true, Ordering::SeqCst);
        }
        passed
    }

    /// Runs a command on `machine`, failing the test if the test times out first. Standard error
    /// is appended to the test's output.
    pub async fn ssh(
        &self,
        machine: &Arc<dyn Machine>,
        cmd: &str,
    ) -> Result<Result<Vec<u8>, ProvisionError>, TestAbort> {
        let res = self
            .h
            .run_with_exec_timeout_check(machine.ssh(cmd), &format!("ssh: {cmd}"))
            .await?;
        Ok(res.map(|output| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stderr.lines() {
                self.h.log(line);
            }
            output.stdout
        }))
    }

    /// Runs a command on `machine`, failing the test if it fails.
    pub async fn must_ssh(
        &self,
        machine: &Arc<dyn Machine>,
        cmd: &str,
    ) -> Result<Vec<u8>, TestAbort> {
        match self.ssh(machine, cmd).await? {
            Ok(stdout) => Ok(stdout),
            Err(err) => Err(self.h.fatal(format_args!("{cmd:?} failed: {err}"))),
        }
    }

    /// Runs a native function on `machine` as a subtest.
    pub async fn run_native(&self, func: &str, machine: Arc<dyn Machine>) -> bool {
        if !self.native_funcs.iter().any(|f| f == func) {
            self.h
                .error(format_args!("native function {func:?} is not available"));
            return false;
        }
        let cmd = format!("./sortie-agent run {:?} {func:?}", self.h.name());
        self.run(func, move |c| async move {
            let output = c.ssh(&machine, &cmd).await?;
            match output {
                Ok(stdout) => {
                    let stdout = String::from_utf8_lossy(&stdout);
                    let stdout = stdout.trim();
                    if !stdout.is_empty() {
                        c.h().log(format_args!("sortie-agent:\n{stdout}"));
                    }
                    Ok(())
                }
                Err(err) => Err(c.h().fatal(format_args!("sortie-agent: {err}"))),
            }
        })
        .await
    }
}

impl fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCluster")
            .field("h", &self.h)
            .field("native_funcs", &self.native_funcs)
            .field("fail_fast", &self.fail_fast)
            .finish_non_exhaustive()
    }
}
