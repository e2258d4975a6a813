// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests that ship with the `sortie` binary.

use sortie_runner::{
    errors::RegistrationError,
    harness::TestAbort,
    platform::{Machine, TestCluster},
    registry::{NEEDS_INTERNET_TAG, Registries, Registry, TestBody, TestSpec},
};
use std::{sync::Arc, time::Duration};

/// Returns the registries with every built-in test.
pub(crate) fn registries() -> Result<Registries, RegistrationError> {
    let mut tests = Registry::new();
    tests.register(basic())?;
    tests.register(cluster_ping())?;
    tests.register(files("non-exclusive.files"))?;
    tests.register(env_roundtrip())?;
    tests.register(needs_net())?;
    tests.register(sleep())?;

    let mut upgrade_tests = Registry::new();
    let mut upgrade = files("upgrade.files");
    upgrade.non_exclusive = false;
    upgrade.description = "Checks that files survive on an upgraded machine".to_owned();
    upgrade_tests.register(upgrade)?;

    Ok(Registries {
        tests,
        upgrade_tests,
    })
}

fn basic() -> TestSpec {
    let mut spec = TestSpec::new(
        "basic",
        TestBody::new(|tc| async move {
            tc.run("uname", |c| async move {
                let stdout = c.must_ssh(&first_machine(&c)?, "uname -s").await?;
                if stdout.trim_ascii().is_empty() {
                    return Err(c.h().fatal("uname printed nothing"));
                }
                Ok(())
            })
            .await;
            tc.run("write-file", |c| async move {
                let machine = first_machine(&c)?;
                c.must_ssh(&machine, "echo hello > greeting").await?;
                expect_stdout(&c, "cat greeting", "hello\n").await
            })
            .await;
            Ok(())
        }),
    );
    spec.description = "Runs a couple of commands on a machine".to_owned();
    spec.subtests = vec!["uname".to_owned(), "write-file".to_owned()];
    spec.fail_fast = true;
    spec
}

fn cluster_ping() -> TestSpec {
    let mut spec = TestSpec::new(
        "cluster.ping",
        TestBody::new(|tc| async move {
            let machines = tc.machines();
            if machines.len() != 2 {
                return Err(tc
                    .h()
                    .fatal(format_args!("expected 2 machines, got {}", machines.len())));
            }
            for machine in &machines {
                let id = machine.id();
                let stdout = tc.must_ssh(machine, &format!("echo {id}")).await?;
                let stdout = String::from_utf8_lossy(&stdout);
                if stdout.trim() != id {
                    return Err(tc.h().fatal(format_args!("{id} answered {stdout:?}")));
                }
            }
            Ok(())
        }),
    );
    spec.description = "Checks that every machine of a cluster answers".to_owned();
    spec.cluster_size = 2;
    spec
}

fn files(name: &str) -> TestSpec {
    let mut spec = TestSpec::new(
        name,
        TestBody::new(|tc| async move {
            let machine = first_machine(&tc)?;
            let dir = format!("files-{}", tc.h().name().replace('/', "-"));
            tc.must_ssh(&machine, &format!("mkdir -p {dir} && touch {dir}/a {dir}/b"))
                .await?;
            expect_stdout(&tc, &format!("ls {dir}"), "a\nb\n").await
        }),
    );
    spec.description = "Creates and lists files".to_owned();
    spec.non_exclusive = true;
    spec
}

fn env_roundtrip() -> TestSpec {
    let mut spec = TestSpec::new(
        "non-exclusive.env",
        TestBody::new(|tc| async move {
            expect_stdout(&tc, "FOO=bar sh -c 'echo $FOO'", "bar\n").await
        }),
    );
    spec.description = "Passes environment variables to a command".to_owned();
    spec.non_exclusive = true;
    spec
}

fn needs_net() -> TestSpec {
    let mut spec = TestSpec::new(
        "demo.needs-net",
        TestBody::new(|tc| async move {
            let machine = first_machine(&tc)?;
            tc.must_ssh(&machine, "true").await?;
            Ok(())
        }),
    );
    spec.description = "Skipped with --no-net".to_owned();
    spec.tags.push(NEEDS_INTERNET_TAG.to_owned());
    spec
}

fn sleep() -> TestSpec {
    let mut spec = TestSpec::new(
        "demo.sleep",
        TestBody::new(|tc| async move {
            let machine = first_machine(&tc)?;
            tc.must_ssh(&machine, "sleep 30").await?;
            Ok(())
        }),
    );
    spec.description = "Runs into its timeout; only runs with --tag slow".to_owned();
    spec.required_tag = Some("slow".to_owned());
    spec.timeout = Some(Duration::from_secs(2));
    spec
}

fn first_machine(tc: &TestCluster) -> Result<Arc<dyn Machine>, TestAbort> {
    tc.machines()
        .into_iter()
        .next()
        .ok_or_else(|| tc.h().fatal("no machines in cluster"))
}

async fn expect_stdout(tc: &TestCluster, cmd: &str, expected: &str) -> Result<(), TestAbort> {
    let machine = first_machine(tc)?;
    let stdout = tc.must_ssh(&machine, cmd).await?;
    let stdout = String::from_utf8_lossy(&stdout);
    if stdout != expected {
        return Err(tc
            .h()
            .fatal(format_args!("{cmd:?}: expected {expected:?}, got {stdout:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn registers_everything() {
        let registries = registries().unwrap();
        let names: Vec<_> = registries.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "basic",
                "cluster.ping",
                "demo.needs-net",
                "demo.sleep",
                "non-exclusive.env",
                "non-exclusive.files",
            ]
        );
        assert_eq!(registries.upgrade_tests.len(), 1);
        assert!(registries.tests.get("basic").unwrap().fail_fast);
    }
}
