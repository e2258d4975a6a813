// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sortie's layered configuration.
//!
//! The defaults in `default-config.toml` are embedded in the binary. A user config file, by
//! default `.config/sortie.toml`, is layered on top, and command-line flags override both.

use crate::errors::{ConfigParseError, ConfigParseErrorKind, ParallelismParseError};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigError, File, FileFormat};
use itertools::Itertools;
use serde::Deserialize;
use std::{cmp::Ordering, collections::BTreeSet, fmt, str::FromStr, sync::LazyLock, time::Duration};
use tracing::warn;

/// Returns the number of logical CPUs, or 1 if that can't be determined.
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Overall configuration for sortie.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortieConfig {
    /// Settings for running tests.
    pub run: RunSettings,
    /// Where to find the denylist.
    #[serde(default)]
    pub denylist: DenylistSettings,
}

/// The `[run]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSettings {
    /// Number of tests to run in parallel.
    pub parallel: Parallelism,
    /// Percentage by which every test timeout is extended.
    pub extend_timeout_percent: u32,
    /// Timeout for tests that don't declare one.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Timeout for bucket members that don't declare one.
    #[serde(with = "humantime_serde")]
    pub bucket_member_default_timeout: Duration,
    /// How many times to try bringing up a test's machines.
    pub provision_attempts: u32,
    /// Delay between attempts to bring up machines.
    #[serde(with = "humantime_serde")]
    pub provision_retry_delay: Duration,
    /// How long to wait for journals to flush after a test body returns.
    #[serde(with = "humantime_serde")]
    pub journal_flush_grace: Duration,
    /// How long a timed-out test may keep running before it is abandoned.
    #[serde(with = "humantime_serde")]
    pub timeout_abandon_grace: Duration,
    /// The platform platform-independent tests are pinned to.
    pub platform_independent_platform: String,
    /// Directory under which run output directories are created.
    pub output_base_dir: Utf8PathBuf,
}

/// The `[denylist]` section.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DenylistSettings {
    /// YAML file with deny rules.
    pub path: Option<Utf8PathBuf>,
    /// YAML build manifest that scopes deny rules by stream and OS version.
    pub manifest: Option<Utf8PathBuf>,
}

impl SortieConfig {
    /// The default location of the user config, relative to the working directory.
    pub const CONFIG_PATH: &'static str = ".config/sortie.toml";

    /// The embedded default configuration.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the configuration.
    ///
    /// If `config_file` is `None`, `<root>/.config/sortie.toml` is read if it exists. An explicitly
    /// passed file must exist.
    pub fn from_sources(
        root: &Utf8Path,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (path, required) = match config_file {
            Some(path) => (path.to_owned(), true),
            None => (root.join(Self::CONFIG_PATH), false),
        };
        let builder = Self::make_default_config()
            .add_source(File::new(path.as_str(), FileFormat::Toml).required(required));
        Self::build(builder, &path)
    }

    /// Reads the defaults layered with a TOML string. Useful for tests.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigParseError> {
        let builder = Self::make_default_config().add_source(File::from_str(toml, FileFormat::Toml));
        Self::build(builder, Utf8Path::new("<inline>"))
    }

    /// Returns the default configuration.
    pub fn default_config() -> Self {
        Self::build(Self::make_default_config(), Utf8Path::new("<default config>"))
            .expect("default config is always valid")
    }

    fn make_default_config() -> config::ConfigBuilder<config::builder::DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        path: &Utf8Path,
    ) -> Result<Self, ConfigParseError> {
        let (config, ignored) = Self::build_and_deserialize(builder)
            .map_err(|kind| ConfigParseError::new(path, kind))?;
        if !ignored.is_empty() {
            warn!(
                "ignoring unknown configuration keys in {path}: {}",
                ignored.iter().join(", ")
            );
        }
        Ok(config)
    }

    fn build_and_deserialize(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<(Self, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build()
            .map_err(|error| ConfigParseErrorKind::Build(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: Self = serde_path_to_error::deserialize(ignored_de).map_err(|error| {
            // The config crate reports the key too. Keep only serde_path_to_error's copy.
            let path = error.path().clone();
            let error = match error.into_inner() {
                ConfigError::At { error, .. } => *error,
                other => other,
            };
            ConfigParseErrorKind::Deserialize(Box::new(serde_path_to_error::Error::new(
                path, error,
            )))
        })?;
        Ok((config, ignored))
    }
}

/// The `parallel` setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Parallelism {
    /// Run this many tests at once.
    Count(usize),
    /// Run as many tests at once as there are logical CPUs.
    NumCpus,
}

impl Parallelism {
    /// Returns the number of parallel tests.
    pub fn compute(self) -> usize {
        match self {
            Self::Count(count) => count,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

impl FromStr for Parallelism {
    type Err = ParallelismParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }
        match s.parse::<usize>() {
            Ok(0) => Err(ParallelismParseError::new("parallelism may not be 0")),
            Ok(count) => Ok(Self::Count(count)),
            Err(err) => Err(ParallelismParseError::new(format!("error parsing {s}: {err}"))),
        }
    }
}

impl fmt::Display for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::NumCpus => f.write_str("num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for Parallelism {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = Parallelism;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a positive integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(Parallelism::NumCpus)
                } else {
                    Err(E::invalid_value(serde::de::Unexpected::Str(v), &self))
                }
            }

            // TOML integers are i64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v.cmp(&0) {
                    Ordering::Greater => Ok(Parallelism::Count(v as usize)),
                    _ => Err(E::invalid_value(serde::de::Unexpected::Signed(v), &self)),
                }
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match v {
                    0 => Err(E::invalid_value(serde::de::Unexpected::Unsigned(v), &self)),
                    _ => Ok(Parallelism::Count(v as usize)),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}
