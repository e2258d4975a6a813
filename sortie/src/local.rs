// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A flight whose machines are scratch directories on this host.
//!
//! Commands sent to a machine run through `sh -c` with the machine's directory as the working
//! directory, and absolute paths on the machine map to paths under that directory. Machines boot
//! with a rendered config: the systemd units in it can be started with the agent's
//! `run-test-unit` command, and their output is recorded in the machine's journal under the
//! name of the unit's executable.

use camino::{Utf8Path, Utf8PathBuf};
use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;
use sortie_runner::{
    conf::Config,
    errors::ProvisionError,
    platform::{Cluster, Flight, Machine, MachineOptions, RuntimeConfig, SshOutput},
};
use std::{
    collections::BTreeMap,
    process::{ExitStatus, Output},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::process::Command;
use tracing::{debug, warn};

/// Largest config a local machine boots with, in bytes.
pub(crate) const USER_DATA_LIMIT: usize = 32 * 1024;

const CONSOLE_FILE_NAME: &str = "console.txt";
const JOURNAL_FILE_NAME: &str = "journal.txt";

/// Hands out local machines, pretending to be the given platform.
#[derive(Debug)]
pub(crate) struct LocalFlight {
    platform: String,
    next_id: Arc<AtomicUsize>,
}

impl LocalFlight {
    pub(crate) fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            next_id: Arc::new(AtomicUsize::new(1)),
        }
    }
}

impl Flight for LocalFlight {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn new_cluster(
        &self,
        config: RuntimeConfig,
    ) -> BoxFuture<'static, Result<Arc<dyn Cluster>, ProvisionError>> {
        let cluster: Arc<dyn Cluster> = Arc::new(LocalCluster {
            root: config.output_dir,
            next_id: self.next_id.clone(),
            machines: Mutex::new(Vec::new()),
        });
        async move { Ok(cluster) }.boxed()
    }

    fn config_too_large(&self, config: &Config) -> bool {
        config.serialized_len() > USER_DATA_LIMIT
    }

    fn destroy(&self) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

struct LocalCluster {
    root: Utf8PathBuf,
    next_id: Arc<AtomicUsize>,
    machines: Mutex<Vec<Arc<LocalMachine>>>,
}

impl LocalCluster {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<LocalMachine>>> {
        self.machines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Cluster for LocalCluster {
    fn new_machine(
        &self,
        config: &Config,
        options: MachineOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn Machine>, ProvisionError>> {
        let id = format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let machine = Arc::new(LocalMachine {
            state: Arc::new(MachineState {
                root: self.root.join(&id),
                id,
                units: systemd_units(config),
                console: Mutex::new(String::new()),
                journal: Mutex::new(Vec::new()),
                statuses: Mutex::new(BTreeMap::new()),
            }),
        });
        self.lock().push(machine.clone());

        async move {
            if !options.skip_start_machine {
                machine.state.clone().boot().await?;
            }
            Ok::<_, ProvisionError>(machine as Arc<dyn Machine>)
        }
        .boxed()
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.lock()
            .iter()
            .map(|m| m.clone() as Arc<dyn Machine>)
            .collect()
    }

    fn console_output(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .map(|m| (m.state.id.clone(), m.state.console_text()))
            .collect()
    }

    fn journal_output(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .map(|m| (m.state.id.clone(), m.state.journal_text(None)))
            .collect()
    }

    fn destroy(&self) -> BoxFuture<'static, ()> {
        let machines: Vec<_> = self.lock().iter().map(|m| m.state.clone()).collect();
        async move {
            for state in machines {
                state.save_logs().await;
            }
        }
        .boxed()
    }
}

struct LocalMachine {
    state: Arc<MachineState>,
}

impl Machine for LocalMachine {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn start(&self) -> BoxFuture<'static, Result<(), ProvisionError>> {
        self.state.clone().boot().boxed()
    }

    fn ssh(&self, cmd: &str) -> BoxFuture<'static, Result<SshOutput, ProvisionError>> {
        let state = self.state.clone();
        let cmd = cmd.to_owned();
        async move { state.exec(&cmd).await }.boxed()
    }

    fn install_file(
        &self,
        local: &Utf8Path,
        remote: &str,
    ) -> BoxFuture<'static, Result<(), ProvisionError>> {
        let local = local.to_owned();
        let dest = machine_path(&self.state.root, remote);
        async move {
            let copy = async {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&local, &dest).await?;
                make_executable(&dest).await
            };
            copy.await
                .map_err(|err| ProvisionError::with_source(format!("copying {local} to {dest}"), err))
        }
        .boxed()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct SystemdUnit {
    name: String,
    exec_start: Option<String>,
    environment: Vec<(String, String)>,
}

impl SystemdUnit {
    fn parse(name: &str, contents: &str) -> Self {
        let mut unit = Self {
            name: name.to_owned(),
            exec_start: None,
            environment: Vec::new(),
        };
        for line in contents.lines() {
            if let Some(exec) = line.strip_prefix("ExecStart=") {
                unit.exec_start = Some(exec.trim().to_owned());
            } else if let Some(env) = line.strip_prefix("Environment=") {
                if let Some((key, value)) = env.split_once('=') {
                    unit.environment.push((key.to_owned(), value.to_owned()));
                }
            }
        }
        unit
    }
}

fn systemd_units(config: &Config) -> Vec<SystemdUnit> {
    config
        .get("systemd")
        .and_then(|systemd| systemd.get("units"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|unit| {
            let name = unit.get("name")?.as_str()?;
            let contents = unit.get("contents").and_then(Value::as_str).unwrap_or("");
            Some(SystemdUnit::parse(name, contents))
        })
        .collect()
}

/// What a command sent to a local machine does.
#[derive(Clone, Debug, Eq, PartialEq)]
enum LocalCommand<'a> {
    RunUnit(&'a str),
    UnitStatus(&'a str),
    Journal(&'a str),
    Shell(&'a str),
}

impl<'a> LocalCommand<'a> {
    fn parse(cmd: &'a str) -> Self {
        let cmd = cmd.trim();
        let cmd = cmd.strip_prefix("sudo ").unwrap_or(cmd);
        let words: Vec<&str> = cmd.split_whitespace().collect();
        match words.as_slice() {
            ["./sortie-agent", "run-test-unit", .., unit] => Self::RunUnit(*unit),
            ["systemctl", "status", .., unit] => Self::UnitStatus(*unit),
            ["journalctl", "-t", tag] => Self::Journal(*tag),
            _ => Self::Shell(cmd),
        }
    }
}

struct MachineState {
    id: String,
    root: Utf8PathBuf,
    units: Vec<SystemdUnit>,
    console: Mutex<String>,
    journal: Mutex<Vec<(String, String)>>,
    statuses: Mutex<BTreeMap<String, String>>,
}

impl MachineState {
    async fn boot(self: Arc<Self>) -> Result<(), ProvisionError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| ProvisionError::with_source(format!("creating {}", self.root), err))?;
        self.console_line(format_args!("{} booted in {}", self.id, self.root));
        Ok(())
    }

    async fn exec(&self, cmd: &str) -> Result<SshOutput, ProvisionError> {
        debug!("{}: {cmd}", self.id);
        match LocalCommand::parse(cmd) {
            LocalCommand::RunUnit(unit) => self.run_unit(unit).await,
            LocalCommand::UnitStatus(unit) => {
                let status = lock(&self.statuses).get(unit).cloned();
                let status = status.unwrap_or_else(|| format!("{unit}: inactive (dead)\n"));
                Ok(stdout_only(status))
            }
            LocalCommand::Journal(tag) => Ok(stdout_only(self.journal_text(Some(tag)))),
            LocalCommand::Shell(cmd) => {
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .current_dir(&self.root)
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|err| ProvisionError::with_source(format!("running `{cmd}`"), err))?;
                check_output(cmd, output)
            }
        }
    }

    async fn run_unit(&self, name: &str) -> Result<SshOutput, ProvisionError> {
        let Some(unit) = self.units.iter().find(|u| u.name == name) else {
            return Err(ProvisionError::new(format!("unit {name} not found")));
        };
        let Some(exec) = &unit.exec_start else {
            return Err(ProvisionError::new(format!("unit {name} has no ExecStart")));
        };
        let tag = exec.rsplit('/').next().unwrap_or(exec);

        let mut command = Command::new(machine_path(&self.root, exec));
        command.current_dir(&self.root).kill_on_drop(true);
        for (key, value) in &unit.environment {
            if value.starts_with('/') {
                command.env(key, machine_path(&self.root, value));
            } else {
                command.env(key, value);
            }
        }
        let output = command
            .output()
            .await
            .map_err(|err| ProvisionError::with_source(format!("starting {name}"), err))?;

        {
            let mut journal = lock(&self.journal);
            for stream in [&output.stdout, &output.stderr] {
                for line in String::from_utf8_lossy(stream).lines() {
                    journal.push((tag.to_owned(), line.to_owned()));
                }
            }
        }
        lock(&self.statuses).insert(name.to_owned(), format!("{name}: {}\n", output.status));
        check_output(name, output)
    }

    fn console_line(&self, line: impl std::fmt::Display) {
        let mut console = lock(&self.console);
        console.push_str(&line.to_string());
        console.push('\n');
    }

    fn console_text(&self) -> String {
        lock(&self.console).clone()
    }

    fn journal_text(&self, tag: Option<&str>) -> String {
        let mut text = String::new();
        for (entry_tag, line) in lock(&self.journal).iter() {
            match tag {
                Some(tag) if tag == entry_tag => {
                    text.push_str(line);
                    text.push('\n');
                }
                Some(_) => {}
                None => {
                    text.push_str(entry_tag);
                    text.push_str(": ");
                    text.push_str(line);
                    text.push('\n');
                }
            }
        }
        text
    }

    async fn save_logs(&self) {
        for (file, text) in [
            (CONSOLE_FILE_NAME, self.console_text()),
            (JOURNAL_FILE_NAME, self.journal_text(None)),
        ] {
            let path = self.root.join(file);
            if let Err(err) = tokio::fs::write(&path, text).await {
                warn!("failed to write {path}: {err}");
            }
        }
    }
}

/// Maps a path on a machine to the local path backing it.
fn machine_path(root: &Utf8Path, remote: &str) -> Utf8PathBuf {
    root.join(remote.trim_start_matches('/'))
}

fn stdout_only(text: String) -> SshOutput {
    SshOutput {
        stdout: text.into_bytes(),
        stderr: Vec::new(),
    }
}

fn check_output(what: &str, output: Output) -> Result<SshOutput, ProvisionError> {
    if output.status.success() {
        return Ok(SshOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ProvisionError::new(failure_message(what, output.status, stderr.trim())))
}

fn failure_message(what: &str, status: ExitStatus, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("`{what}` failed: {status}")
    } else {
        format!("`{what}` failed: {status}: {stderr}")
    }
}

#[cfg(unix)]
async fn make_executable(path: &Utf8Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Utf8Path) -> std::io::Result<()> {
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("sudo ./sortie-agent run-test-unit sortie-runext.service", LocalCommand::RunUnit("sortie-runext.service") ; "run unit")]
    #[test_case("sudo ./sortie-agent run-test-unit --deny-reboots sortie-runext-2.service", LocalCommand::RunUnit("sortie-runext-2.service") ; "run unit with args")]
    #[test_case("sudo systemctl status --lines=40 a.service", LocalCommand::UnitStatus("a.service") ; "status")]
    #[test_case("journalctl -t sortie-runext-test.sh", LocalCommand::Journal("sortie-runext-test.sh") ; "journal")]
    #[test_case("echo hi > out", LocalCommand::Shell("echo hi > out") ; "shell")]
    fn parse_commands(cmd: &str, expected: LocalCommand<'_>) {
        assert_eq!(LocalCommand::parse(cmd), expected);
    }

    #[test]
    fn parse_unit() {
        let unit = SystemdUnit::parse(
            "sortie-runext.service",
            indoc! {"
                [Service]
                Environment=SORTIE_TEST=ext.foo
                Environment=SORTIE_EXT_DATA=/var/opt/sortie/extdata
                ExecStart=/usr/local/bin/sortie-runext-test.sh
            "},
        );
        assert_eq!(
            unit.exec_start.as_deref(),
            Some("/usr/local/bin/sortie-runext-test.sh")
        );
        assert_eq!(
            unit.environment,
            vec![
                ("SORTIE_TEST".to_owned(), "ext.foo".to_owned()),
                (
                    "SORTIE_EXT_DATA".to_owned(),
                    "/var/opt/sortie/extdata".to_owned()
                ),
            ]
        );
    }

    #[test]
    fn machine_paths() {
        let root = Utf8Path::new("/tmp/out/local-1");
        assert_eq!(
            machine_path(root, "/usr/local/bin/x"),
            "/tmp/out/local-1/usr/local/bin/x"
        );
        assert_eq!(machine_path(root, "data/y"), "/tmp/out/local-1/data/y");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_commands_and_units() {
        let dir = Utf8TempDir::new().unwrap();
        let mut config = Config::empty();
        config.add_systemd_unit(
            "sortie-runext.service",
            indoc! {"
                [Service]
                Environment=GREETING=hello
                ExecStart=/usr/local/bin/greet
            "},
            false,
        );
        let flight = LocalFlight::new("qemu");
        let cluster = flight
            .new_cluster(RuntimeConfig {
                output_dir: dir.path().to_owned(),
                ..RuntimeConfig::default()
            })
            .await
            .unwrap();
        let machine = cluster
            .new_machine(&config, MachineOptions::default())
            .await
            .unwrap();
        assert_eq!(machine.id(), "local-1");

        let output = machine.ssh("echo hi && pwd").await.unwrap();
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert!(stdout.starts_with("hi\n"), "{stdout}");
        machine.ssh("exit 3").await.unwrap_err();

        let script = dir.path().join("greet.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"$GREETING from unit\"\n").unwrap();
        machine
            .install_file(&script, "/usr/local/bin/greet")
            .await
            .unwrap();
        machine
            .ssh("sudo ./sortie-agent run-test-unit sortie-runext.service")
            .await
            .unwrap();
        let journal = machine.ssh("journalctl -t greet").await.unwrap();
        assert_eq!(journal.stdout, b"hello from unit\n");

        cluster.destroy().await;
        let console = std::fs::read_to_string(dir.path().join("local-1/console.txt")).unwrap();
        assert!(console.contains("local-1 booted"), "{console}");
        assert_eq!(
            cluster.console_output().keys().collect::<Vec<_>>(),
            vec!["local-1"]
        );
    }

    #[test]
    fn large_configs() {
        let flight = LocalFlight::new("qemu");
        let mut config = Config::empty();
        assert!(!flight.config_too_large(&config));
        config.add_systemd_unit("big.service", &"x".repeat(USER_DATA_LIMIT), false);
        assert!(flight.config_too_large(&config));
    }
}
