// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovery of external tests.
//!
//! External tests are executables shipped in a directory tree, usually alongside the OS build
//! they test. Each executable becomes a test that runs as a systemd unit on the machine under
//! test. A test directory can also carry user data (`config.ign` or `config.bu`), default
//! metadata (`kola.json`) and a `data` directory that is copied to the machine.
//!
//! Metadata can also be embedded in the executable itself, either as a single JSON comment:
//!
//! ```text
//! # kola: { "tags": "ignition", "architectures": "x86_64" }
//! ```
//!
//! or as a YAML block:
//!
//! ```text
//! ## kola:
//! ##   tags: ignition
//! ##   exclusive: false
//! ```

use crate::{
    conf::{UserData, WarningsAction},
    denylist::Denylist,
    errors::ExternalTestError,
    harness::TestAbort,
    platform::TestCluster,
    registry::{DependencyDir, EXTERNAL_TAG, Flag, Registry, TestBody, TestSpec},
};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::{fs, io::Read, time::Duration};
use tracing::{debug, warn};

/// Where external tests live, relative to the directory handed to [`ExternalTestLoader`].
pub const TESTS_SUBDIR: &str = "tests/kola";

/// An executable with this name, alone in its directory, is named after the directory.
pub const DEFAULT_TEST_NAME: &str = "test.sh";

/// Name of the directory of data files shipped with a test.
pub const DATA_DIR_NAME: &str = "data";

const JSON_META_PREFIX: &str = "# kola:";
const YAML_META_PREFIX: &str = "## kola:";
const YAML_LINE_PREFIX: &str = "## ";
const META_SCAN_LIMIT: u64 = 8192;

const UNIT_PREFIX: &str = "sortie-runext";
const REMOTE_DATA_DIR: &str = "/var/opt/sortie/extdata";

/// Metadata for an external test.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ExternalTestMeta {
    /// Whitespace-separated architectures. A leading `!` excludes them instead.
    pub architectures: String,
    /// Whitespace-separated platforms. A leading `!` excludes them instead.
    pub platforms: String,
    /// Whitespace-separated distributions. A leading `!` excludes them instead.
    pub distros: String,
    /// Whitespace-separated tags.
    pub tags: String,
    /// A tag that must be requested for the test to run.
    pub required_tag: String,
    /// Whether the test needs a machine to itself.
    pub exclusive: bool,
    /// Timeout in minutes. Zero uses the default.
    pub timeout_min: u64,
    /// Tests that must not share a machine with this one.
    pub conflicts: Vec<String>,
    /// Render user data even if it produces warnings.
    pub allow_config_warnings: bool,
    /// Don't grant the machine instance credentials.
    pub no_instance_creds: bool,
    /// Description shown by `list`.
    pub description: String,
}

impl Default for ExternalTestMeta {
    fn default() -> Self {
        Self {
            architectures: String::new(),
            platforms: String::new(),
            distros: String::new(),
            tags: String::new(),
            required_tag: String::new(),
            exclusive: true,
            timeout_min: 0,
            conflicts: Vec::new(),
            allow_config_warnings: false,
            no_instance_creds: false,
            description: String::new(),
        }
    }
}

impl ExternalTestMeta {
    /// Reads metadata embedded in the head of an executable, if there is any.
    pub fn from_executable(path: &Utf8Path) -> Result<Option<Self>, ExternalTestError> {
        let io_err = |err| ExternalTestError::Io {
            path: path.to_owned(),
            err,
        };
        let mut head = Vec::new();
        fs::File::open(path)
            .map_err(io_err)?
            .take(META_SCAN_LIMIT)
            .read_to_end(&mut head)
            .map_err(io_err)?;
        Self::parse_embedded(&String::from_utf8_lossy(&head), path)
    }

    /// Parses metadata embedded in script text. `path` is only used for errors.
    pub fn parse_embedded(text: &str, path: &Utf8Path) -> Result<Option<Self>, ExternalTestError> {
        let mut yaml: Option<String> = None;
        for line in text.lines() {
            if line.starts_with(YAML_META_PREFIX) {
                if yaml.is_some() {
                    return Err(ExternalTestError::MultipleYamlMetadata {
                        path: path.to_owned(),
                    });
                }
                yaml = Some(String::new());
            } else if let Some(json) = line.strip_prefix(JSON_META_PREFIX) {
                if yaml.is_some() {
                    return Err(ExternalTestError::BothMetadataFormats {
                        path: path.to_owned(),
                    });
                }
                let meta = serde_json::from_str(json.trim()).map_err(|err| {
                    ExternalTestError::JsonMetadata {
                        path: path.to_owned(),
                        err,
                    }
                })?;
                return Ok(Some(meta));
            } else if let Some(block) = yaml.as_mut() {
                match line.strip_prefix(YAML_LINE_PREFIX) {
                    Some(rest) => {
                        block.push_str(rest);
                        block.push('\n');
                    }
                    None => break,
                }
            }
        }

        match yaml {
            Some(block) if block.trim().is_empty() => Ok(Some(Self::default())),
            Some(block) => serde_yaml::from_str(&block).map(Some).map_err(|err| {
                ExternalTestError::YamlMetadata {
                    path: path.to_owned(),
                    err,
                }
            }),
            None => Ok(None),
        }
    }

    fn from_json_file(path: &Utf8Path) -> Result<Self, ExternalTestError> {
        let text = fs::read_to_string(path).map_err(|err| ExternalTestError::Io {
            path: path.to_owned(),
            err,
        })?;
        serde_json::from_str(&text).map_err(|err| ExternalTestError::JsonMetadata {
            path: path.to_owned(),
            err,
        })
    }
}

/// Splits a whitespace-separated list into allowed and excluded items.
fn split_list(list: &str) -> (Vec<String>, Vec<String>) {
    let to_vec = |s: &str| -> Vec<String> { s.split_whitespace().map(str::to_owned).collect() };
    match list.strip_prefix('!') {
        Some(excluded) => (Vec::new(), to_vec(excluded)),
        None => (to_vec(list), Vec::new()),
    }
}

/// Registers external tests from one or more directories.
///
/// Non-exclusive tests get numbered systemd units so that several of them can share one
/// machine. Numbering continues across directories.
#[derive(Debug)]
pub struct ExternalTestLoader<'a> {
    denylist: &'a Denylist,
    next_unit: usize,
}

/// Everything collected from one test directory.
#[derive(Default)]
struct TestDir {
    executables: Vec<Utf8PathBuf>,
    user_data: UserData,
    meta: Option<ExternalTestMeta>,
    dependency_dir: Option<Utf8PathBuf>,
}

impl<'a> ExternalTestLoader<'a> {
    /// Creates a loader that won't register tests denied by `denylist`.
    pub fn new(denylist: &'a Denylist) -> Self {
        Self {
            denylist,
            next_unit: 1,
        }
    }

    /// Registers the tests under `<dir>/tests/kola`, with the prefix `ext.<basename of dir>`.
    ///
    /// A directory without tests registers nothing.
    pub fn register_dir(
        &mut self,
        registry: &mut Registry,
        dir: &Utf8Path,
    ) -> Result<usize, ExternalTestError> {
        let base = dir.file_name().unwrap_or(dir.as_str());
        self.register_dir_with_prefix(registry, dir, &format!("ext.{base}"))
    }

    /// Registers the tests under `<dir>/tests/kola`, with the given prefix.
    pub fn register_dir_with_prefix(
        &mut self,
        registry: &mut Registry,
        dir: &Utf8Path,
        prefix: &str,
    ) -> Result<usize, ExternalTestError> {
        let tests_dir = dir.join(TESTS_SUBDIR);
        if !tests_dir.exists() {
            debug!("no external tests in {dir}");
            return Ok(0);
        }
        let before = registry.len();
        self.register_test_dir(registry, &tests_dir, prefix)?;
        Ok(registry.len() - before)
    }

    fn register_test_dir(
        &mut self,
        registry: &mut Registry,
        dir: &Utf8Path,
        prefix: &str,
    ) -> Result<(), ExternalTestError> {
        let io_err = |path: &Utf8Path| {
            let path = path.to_owned();
            move |err| ExternalTestError::Io { path, err }
        };

        let mut entries = dir
            .read_dir_utf8()
            .map_err(io_err(dir))?
            .map(|entry| entry.map(|e| e.into_path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err(dir))?;
        entries.sort();

        let mut found = TestDir::default();
        for path in entries {
            let Some(name) = path.file_name() else {
                continue;
            };
            // Follows symlinks.
            let meta = fs::metadata(&path).map_err(io_err(&path))?;

            if meta.is_dir() && name == DATA_DIR_NAME {
                let is_link = fs::symlink_metadata(&path)
                    .map_err(io_err(&path))?
                    .file_type()
                    .is_symlink();
                let dir = if is_link {
                    path.canonicalize_utf8().map_err(io_err(&path))?
                } else {
                    path
                };
                found.dependency_dir = Some(dir);
            } else if meta.is_dir() {
                self.register_test_dir(registry, &path, &format!("{prefix}.{name}"))?;
            } else if !meta.is_file() {
                continue;
            } else if is_executable(&meta) {
                found.executables.push(path);
            } else if name == "config.ign" {
                let text = fs::read_to_string(&path).map_err(io_err(&path))?;
                found.user_data = UserData::Ignition(text);
            } else if name == "config.bu" {
                let text = fs::read_to_string(&path).map_err(io_err(&path))?;
                found.user_data = UserData::Butane(text);
            } else if name == "config.fcc" {
                return Err(ExternalTestError::UnsupportedFcc { path });
            } else if name == "kola.json" {
                found.meta = Some(ExternalTestMeta::from_json_file(&path)?);
            } else if has_shebang(&path) {
                warn!("found non-executable file with shebang: {path}");
            }
        }

        let single = found.executables.len() == 1;
        for executable in &found.executables {
            let file_name = executable.file_name().unwrap_or(executable.as_str());
            let name = if single && file_name == DEFAULT_TEST_NAME {
                prefix.to_owned()
            } else {
                format!("{prefix}.{file_name}")
            };
            // Denied tests aren't registered, so their user data is never rendered.
            if self.denylist.is_denylisted(&name) {
                debug!("skipping denylisted external test {name}");
                continue;
            }
            self.register_test(registry, name, executable, &found)?;
        }
        Ok(())
    }

    fn register_test(
        &mut self,
        registry: &mut Registry,
        name: String,
        executable: &Utf8Path,
        dir: &TestDir,
    ) -> Result<(), ExternalTestError> {
        let meta = match ExternalTestMeta::from_executable(executable)? {
            Some(meta) => meta,
            None => dir.meta.clone().unwrap_or_default(),
        };

        let warnings = if meta.allow_config_warnings {
            WarningsAction::Ignore
        } else {
            WarningsAction::Fail
        };
        let mut config = dir
            .user_data
            .render(warnings)
            .map_err(|err| ExternalTestError::Render {
                name: name.clone(),
                err,
            })?;

        let (unit, remote_data, agent_args) = if meta.exclusive {
            (
                format!("{UNIT_PREFIX}.service"),
                REMOTE_DATA_DIR.to_owned(),
                String::new(),
            )
        } else {
            let num = self.next_unit;
            self.next_unit += 1;
            (
                format!("{UNIT_PREFIX}-{num}.service"),
                format!("{REMOTE_DATA_DIR}-{num}"),
                "--deny-reboots ".to_owned(),
            )
        };
        let exe_name = executable.file_name().unwrap_or(executable.as_str());
        let remote_exe = remote_executable_path(executable);
        let contents = format!(
            "[Unit]\n\
             [Service]\n\
             RemainAfterExit=yes\n\
             EnvironmentFile=-/run/{UNIT_PREFIX}-env\n\
             Environment=SORTIE_UNIT={unit}\n\
             Environment=SORTIE_TEST={name}\n\
             Environment=SORTIE_TEST_EXE={exe_name}\n\
             Environment=SORTIE_EXT_DATA={remote_data}\n\
             ExecStart={remote_exe}\n"
        );
        config.add_systemd_unit(&unit, &contents, false);

        let run_cmd = format!("sudo ./sortie-agent run-test-unit {agent_args}{unit}");
        let status_cmd = format!("sudo systemctl status --lines=40 {unit}");
        let body = TestBody::new(move |tc| run_unit(tc, run_cmd.clone(), status_cmd.clone()));

        let mut spec = TestSpec::new(name, body);
        spec.description = meta.description;
        spec.cluster_size = 1;
        spec.external_test = Some(executable.to_owned());
        spec.dependency_dir = dir.dependency_dir.as_ref().map(|local| DependencyDir {
            local: local.clone(),
            remote: remote_data,
        });
        spec.user_data = UserData::Ignition(config.to_json_string());
        spec.timeout =
            (meta.timeout_min > 0).then(|| Duration::from_secs(meta.timeout_min * 60));
        spec.non_exclusive = !meta.exclusive;
        spec.conflicts = meta.conflicts;
        (spec.architectures, spec.exclude_architectures) = split_list(&meta.architectures);
        (spec.platforms, spec.exclude_platforms) = split_list(&meta.platforms);
        (spec.distros, spec.exclude_distros) = split_list(&meta.distros);
        if meta.no_instance_creds {
            spec.flags.push(Flag::NoInstanceCreds);
        }
        if meta.allow_config_warnings {
            spec.flags.push(Flag::AllowConfigWarnings);
        }
        spec.tags.push(EXTERNAL_TAG.to_owned());
        spec.tags.extend(meta.tags.split_whitespace().map(str::to_owned));
        spec.required_tag = Some(meta.required_tag).filter(|t| !t.is_empty());

        registry.register(spec)?;
        Ok(())
    }
}

async fn run_unit(tc: TestCluster, run_cmd: String, status_cmd: String) -> Result<(), TestAbort> {
    let Some(machine) = tc.machines().into_iter().next() else {
        return Err(tc.h().fatal("external test has no machine to run on"));
    };
    debug!("running {run_cmd}");
    let err = match tc.ssh(&machine, &run_cmd).await? {
        Ok(_) => return Ok(()),
        Err(err) => err,
    };
    match tc.ssh(&machine, &status_cmd).await? {
        Ok(status) if !status.is_empty() => {
            tc.h().log(format_args!(
                "{status_cmd}:\n{}",
                String::from_utf8_lossy(&status)
            ));
        }
        Ok(_) => {}
        Err(status_err) => tc.h().log(format_args!("fetching status failed: {status_err}")),
    }
    Err(tc.h().fatal(format_args!("sortie-agent failed: {err}")))
}

fn remote_executable_path(executable: &Utf8Path) -> String {
    let exe_name = executable.file_name().unwrap_or(executable.as_str());
    format!("/usr/local/bin/{UNIT_PREFIX}-{exe_name}")
}

/// Installs an external test's executable on every machine of the cluster.
pub(crate) async fn install_executable(tc: &TestCluster, spec: &TestSpec) -> Result<(), TestAbort> {
    let Some(executable) = &spec.external_test else {
        return Ok(());
    };
    let remote = remote_executable_path(executable);
    for machine in tc.machines() {
        let install = machine.install_file(executable, &remote);
        let res = tc
            .h()
            .run_with_exec_timeout_check(install, &format!("uploading {executable}"))
            .await?;
        if let Err(err) = res {
            return Err(tc.h().fatal(format_args!("uploading {executable}: {err}")));
        }
    }
    Ok(())
}

/// Saves the journal of an external test's unit from every machine, into
/// `<output dir>/<machine id>/<test name>.txt`.
pub(crate) async fn collect_logs(
    tc: &TestCluster,
    spec: &TestSpec,
    output_dir: &Utf8Path,
) -> Result<(), TestAbort> {
    let Some(executable) = &spec.external_test else {
        return Ok(());
    };
    let exe_name = executable.file_name().unwrap_or(executable.as_str());
    for machine in tc.machines() {
        let dir = output_dir.join(machine.id());
        let path = dir.join(format!("{}.txt", spec.name));
        let journal = tc
            .must_ssh(&machine, &format!("journalctl -t {UNIT_PREFIX}-{exe_name}"))
            .await?;
        let write = fs::create_dir_all(&dir).and_then(|()| fs::write(&path, &journal));
        if let Err(err) = write {
            tc.h().error(format_args!("failed to write journal to {path}: {err}"));
        }
    }
    Ok(())
}

/// Copies the files of a dependency directory to every machine of the cluster.
pub(crate) async fn install_dependency_dir(
    tc: &TestCluster,
    dir: &DependencyDir,
) -> Result<(), TestAbort> {
    let files = match collect_files(&dir.local) {
        Ok(files) => files,
        Err(err) => {
            return Err(tc.h().fatal(format_args!("reading {}: {err}", dir.local)));
        }
    };
    for machine in tc.machines() {
        for rel in &files {
            let local = dir.local.join(rel);
            let remote = format!("{}/{rel}", dir.remote);
            let res = tc
                .h()
                .run_with_exec_timeout_check(
                    machine.install_file(&local, &remote),
                    &format!("copying {local}"),
                )
                .await?;
            if let Err(err) = res {
                return Err(tc.h().fatal(format_args!("copying {local}: {err}")));
            }
        }
    }
    Ok(())
}

/// Returns the files under `root`, relative to it, in sorted order.
fn collect_files(root: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![Utf8PathBuf::new()];
    while let Some(rel) = stack.pop() {
        for entry in root.join(&rel).read_dir_utf8()? {
            let entry = entry?;
            let child = rel.join(entry.file_name());
            if fs::metadata(entry.path())?.is_dir() {
                stack.push(child);
            } else {
                out.push(child);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn has_shebang(path: &Utf8Path) -> bool {
    let mut head = [0u8; 2];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .is_ok_and(|()| &head == b"#!")
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o001 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn registered(registry: &Registry, name: &str) -> Arc<TestSpec> {
        registry
            .get(name)
            .unwrap_or_else(|| panic!("{name} not registered"))
            .clone()
    }

    fn parse(text: &str) -> Result<Option<ExternalTestMeta>, ExternalTestError> {
        ExternalTestMeta::parse_embedded(text, Utf8Path::new("test.sh"))
    }

    #[test]
    fn json_metadata() {
        let meta = parse(indoc! {r#"
            #!/bin/bash
            # kola: { "tags": "ignition reprovision", "architectures": "!s390x", "timeoutMin": 5 }
            set -xeuo pipefail
        "#})
        .unwrap()
        .unwrap();
        assert_eq!(meta.tags, "ignition reprovision");
        assert_eq!(meta.architectures, "!s390x");
        assert_eq!(meta.timeout_min, 5);
        assert!(meta.exclusive);
    }

    #[test]
    fn yaml_metadata() {
        let meta = parse(indoc! {r#"
            #!/bin/bash
            ## kola:
            ##   exclusive: false
            ##   conflicts:
            ##     - ext.other
            ##   description: Checks things.
            set -xeuo pipefail
        "#})
        .unwrap()
        .unwrap();
        assert!(!meta.exclusive);
        assert_eq!(meta.conflicts, vec!["ext.other"]);
        assert_eq!(meta.description, "Checks things.");
    }

    #[test]
    fn yaml_metadata_at_end_of_file() {
        let meta = parse("#!/bin/sh\n## kola:\n##   tags: slow\n").unwrap().unwrap();
        assert_eq!(meta.tags, "slow");
    }

    #[test]
    fn no_metadata() {
        assert_eq!(parse("#!/bin/bash\necho hi\n").unwrap(), None);
    }

    #[test]
    fn both_formats_rejected() {
        let err = parse("## kola:\n# kola: {}\n").unwrap_err();
        assert!(matches!(err, ExternalTestError::BothMetadataFormats { .. }));
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = parse("# kola: { \"tagz\": \"typo\" }\n").unwrap_err();
        assert!(matches!(err, ExternalTestError::JsonMetadata { .. }));
    }

    #[test]
    fn split_lists() {
        assert_eq!(
            split_list("x86_64 aarch64"),
            (vec!["x86_64".to_owned(), "aarch64".to_owned()], vec![])
        );
        assert_eq!(split_list("!s390x"), (vec![], vec!["s390x".to_owned()]));
        assert_eq!(split_list(""), (vec![], vec![]));
    }

    #[cfg(unix)]
    fn write_executable(path: &Utf8Path, contents: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn scans_test_tree() {
        let root = Utf8TempDir::new().unwrap();
        let dir = root.path().join("fcos");
        let tests = dir.join(TESTS_SUBDIR);

        write_executable(&tests.join("basic/test.sh"), "#!/bin/sh\ntrue\n");
        fs::write(
            tests.join("basic/config.bu"),
            "variant: fcos\nversion: 1.5.0\n",
        )
        .unwrap();
        fs::create_dir_all(tests.join("basic/data")).unwrap();
        fs::write(tests.join("basic/data/payload"), "x").unwrap();

        write_executable(
            &tests.join("shared/one"),
            "#!/bin/sh\n## kola:\n##   exclusive: false\n##   platforms: qemu\ntrue\n",
        );
        write_executable(
            &tests.join("shared/two"),
            "#!/bin/sh\n# kola: { \"exclusive\": false, \"requiredTag\": \"slow\" }\n",
        );
        fs::write(tests.join("shared/notes.sh"), "#!/bin/sh\n").unwrap();
        write_executable(&tests.join("denied/test.sh"), "#!/bin/sh\n");

        let mut denylist = Denylist::new();
        denylist.add_deny_pattern("ext.fcos.denied").unwrap();
        let mut registry = Registry::new();
        let count = ExternalTestLoader::new(&denylist)
            .register_dir(&mut registry, &dir)
            .unwrap();
        assert_eq!(count, 3);

        let names: Vec<_> = registry.iter().map(|t| t.name.clone()).collect();
        assert_eq!(
            names,
            vec!["ext.fcos.basic", "ext.fcos.shared.one", "ext.fcos.shared.two"]
        );

        let basic = registered(&registry, "ext.fcos.basic");
        assert!(basic.has_tag(EXTERNAL_TAG));
        assert!(!basic.non_exclusive);
        let deps = basic.dependency_dir.as_ref().unwrap();
        assert_eq!(deps.remote, REMOTE_DATA_DIR);
        let config = basic.user_data.render(WarningsAction::Fail).unwrap();
        assert_eq!(config.systemd_unit_names(), vec!["sortie-runext.service"]);

        let one = registered(&registry, "ext.fcos.shared.one");
        assert!(one.non_exclusive);
        assert_eq!(one.platforms, vec!["qemu"]);
        let config = one.user_data.render(WarningsAction::Fail).unwrap();
        assert_eq!(config.systemd_unit_names(), vec!["sortie-runext-1.service"]);

        let two = registered(&registry, "ext.fcos.shared.two");
        assert_eq!(two.required_tag.as_deref(), Some("slow"));
        let config = two.user_data.render(WarningsAction::Fail).unwrap();
        assert_eq!(config.systemd_unit_names(), vec!["sortie-runext-2.service"]);
    }

    #[cfg(unix)]
    #[test]
    fn fcc_configs_are_rejected() {
        let root = Utf8TempDir::new().unwrap();
        let tests = root.path().join(TESTS_SUBDIR);
        write_executable(&tests.join("old/test.sh"), "#!/bin/sh\n");
        fs::write(tests.join("old/config.fcc"), "variant: fcos\n").unwrap();

        let denylist = Denylist::new();
        let err = ExternalTestLoader::new(&denylist)
            .register_dir(&mut Registry::new(), root.path())
            .unwrap_err();
        assert!(matches!(err, ExternalTestError::UnsupportedFcc { .. }));
    }

    #[test]
    fn missing_tests_dir_registers_nothing() {
        let root = Utf8TempDir::new().unwrap();
        let denylist = Denylist::new();
        let count = ExternalTestLoader::new(&denylist)
            .register_dir(&mut Registry::new(), root.path())
            .unwrap();
        assert_eq!(count, 0);
    }
}
