// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by sortie.

use crate::registry::Flag;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{borrow::Cow, error, fmt};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse sortie config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while reading or merging config sources.
    #[error("error reading config sources")]
    Build(#[source] Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error("error deserializing config")]
    Deserialize(#[source] Box<serde_path_to_error::Error<ConfigError>>),
}

/// Error returned while parsing a [`Parallelism`](crate::config::Parallelism) value from a
/// string.
#[derive(Clone, Debug, Error)]
#[error("invalid parallelism: {message}")]
pub struct ParallelismParseError {
    message: Cow<'static, str>,
}

impl ParallelismParseError {
    pub(crate) fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An error that occurs while parsing a [`Sharding`](crate::partition::Sharding) input.
#[derive(Clone, Debug, Error)]
pub struct ShardingParseError {
    expected_format: Option<&'static str>,
    message: Cow<'static, str>,
}

impl ShardingParseError {
    pub(crate) fn new(
        expected_format: Option<&'static str>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            expected_format,
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardingParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.expected_format {
            Some(format) => {
                write!(
                    f,
                    "invalid sharding input: {} (expected format: {})",
                    self.message, format
                )
            }
            None => write!(f, "invalid sharding input: {}", self.message),
        }
    }
}

/// A test name pattern failed to compile.
#[derive(Clone, Debug, Error)]
#[error("invalid test pattern `{pattern}`")]
pub struct PatternError {
    pattern: String,
    #[source]
    err: globset::Error,
}

impl PatternError {
    pub(crate) fn new(pattern: impl Into<String>, err: globset::Error) -> Self {
        Self {
            pattern: pattern.into(),
            err,
        }
    }

    /// The pattern that failed to compile.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// An error that occurred while building a [`TestFilter`](crate::test_filter::TestFilter).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TestFilterBuildError {
    /// A pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// A pattern the user typed matched no registered test.
    #[error("no tests matched pattern `{pattern}`")]
    NoMatches {
        /// The pattern.
        pattern: String,
    },
}

/// An error that occurred while reading a denylist.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DenylistParseError {
    /// The file could not be read.
    #[error("failed to read `{path}`")]
    Read {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The file is not valid YAML, or doesn't have the expected shape.
    #[error("failed to parse denylist{}", .path.as_ref().map(|p| format!(" `{p}`")).unwrap_or_default())]
    Yaml {
        /// The file, if the YAML came from one.
        path: Option<Utf8PathBuf>,
        /// The underlying error.
        #[source]
        err: serde_yaml::Error,
    },

    /// A snooze date is not in `YYYY-MM-DD` form.
    #[error("invalid snooze date `{snooze}` for pattern `{pattern}`")]
    Snooze {
        /// The rule's pattern.
        pattern: String,
        /// The snooze date as written.
        snooze: String,
        /// The underlying error.
        #[source]
        err: chrono::ParseError,
    },

    /// A rule's pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

impl DenylistParseError {
    pub(crate) fn with_path(self, path: impl Into<Utf8PathBuf>) -> Self {
        match self {
            Self::Yaml { path: None, err } => Self::Yaml {
                path: Some(path.into()),
                err,
            },
            other => other,
        }
    }
}

/// An error that occurred while registering a test.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum RegistrationError {
    /// A test with this name is already registered.
    #[error("test `{name}` is already registered")]
    Duplicate {
        /// The name of the test.
        name: String,
    },

    /// Only non-exclusive tests may declare conflicts.
    #[error("test `{name}` is exclusive, but declares conflicts")]
    ExclusiveWithConflicts {
        /// The name of the test.
        name: String,
    },
}

/// An error that occurred while discovering external tests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExternalTestError {
    /// A file or directory could not be read.
    #[error("failed to read `{path}`")]
    Io {
        /// The path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// JSON metadata could not be parsed.
    #[error("invalid JSON metadata in `{path}`")]
    JsonMetadata {
        /// The file holding the metadata.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },

    /// YAML metadata could not be parsed.
    #[error("invalid YAML metadata in `{path}`")]
    YamlMetadata {
        /// The file holding the metadata.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: serde_yaml::Error,
    },

    /// A test embeds both JSON and YAML metadata.
    #[error("`{path}` has both JSON and YAML metadata")]
    BothMetadataFormats {
        /// The executable.
        path: Utf8PathBuf,
    },

    /// A test embeds more than one YAML metadata block.
    #[error("`{path}` has more than one YAML metadata block")]
    MultipleYamlMetadata {
        /// The executable.
        path: Utf8PathBuf,
    },

    /// A test directory holds a `config.fcc`.
    #[error("`{path}` is no longer supported, rename it to config.bu")]
    UnsupportedFcc {
        /// The file.
        path: Utf8PathBuf,
    },

    /// A test's user data failed to render.
    #[error("failed to render user data for external test `{name}`")]
    Render {
        /// The name of the test.
        name: String,
        /// The underlying error.
        #[source]
        err: ConfigRenderError,
    },

    /// The test could not be registered.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// An error that occurred while packing non-exclusive tests into buckets.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BucketError {
    /// A non-exclusive test carries a flag that can't be honored on a shared machine.
    #[error("non-exclusive test `{name}` cannot use flag {flag}")]
    ForbiddenFlag {
        /// The name of the test.
        name: String,
        /// The flag.
        flag: Flag,
    },

    /// A member's user data failed to render.
    #[error("failed to render user data for non-exclusive test `{name}`")]
    Render {
        /// The name of the test.
        name: String,
        /// The underlying error.
        #[source]
        err: ConfigRenderError,
    },

    /// A single test's config is too large for the platform on its own.
    #[error("config for non-exclusive test `{name}` is too large for the platform")]
    ConfigTooLarge {
        /// The name of the test.
        name: String,
    },
}

/// An error that occurred while rendering user data.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigRenderError {
    /// The Ignition config is not valid JSON.
    #[error("invalid Ignition JSON")]
    InvalidJson(#[source] serde_json::Error),

    /// The Butane config is not valid YAML.
    #[error("invalid Butane YAML")]
    InvalidYaml(#[source] serde_yaml::Error),

    /// The config is not an object at the top level.
    #[error("config is not an object")]
    NotAnObject,

    /// The config produced warnings, and warnings are errors.
    #[error("config has warnings: {}", .warnings.join("; "))]
    Warnings {
        /// The warnings.
        warnings: Vec<String>,
    },
}

/// An error returned by a [`Flight`](crate::platform::Flight), cluster or machine.
#[derive(Debug)]
pub struct ProvisionError {
    message: String,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl ProvisionError {
    /// Creates an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error with a message and an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The source is appended so that single-line log messages stay useful.
        match &self.source {
            Some(source) => write!(f, "{}: {source}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn error::Error + 'static))
    }
}

/// An error that occurred while writing a report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReportWriteError {
    /// A file could not be written.
    #[error("error writing `{file}`")]
    Fs {
        /// The file.
        file: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The JSON report could not be serialized.
    #[error("error serializing JSON report to `{file}`")]
    Json {
        /// The file.
        file: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The JUnit report could not be serialized.
    #[error("error serializing JUnit report to `{file}`")]
    Junit {
        /// The file.
        file: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: quick_junit::SerializeError,
    },
}

/// An error that occurred while reading a previous run's report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReportReadError {
    /// The report could not be read.
    #[error("error reading `{file}`")]
    Read {
        /// The file.
        file: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The report is not valid.
    #[error("error parsing `{file}`")]
    Parse {
        /// The file.
        file: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error that occurred while running a suite.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SuiteError {
    /// The output directory could not be removed.
    #[error("error cleaning output directory `{path}`")]
    CleanOutputDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The output directory could not be created.
    #[error("error creating output directory `{path}`")]
    CreateOutputDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The TAP file could not be written.
    #[error("error writing TAP file `{path}`")]
    WriteTap {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A report could not be written.
    #[error(transparent)]
    Report(#[from] ReportWriteError),
}

/// An error that stopped a run before or after its tests ran.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The test filter could not be built, or a pattern matched no tests.
    #[error(transparent)]
    Filter(#[from] TestFilterBuildError),

    /// No registered test was selected.
    #[error("no tests matched the given patterns and tags")]
    NoMatchingTests,

    /// Non-exclusive tests could not be packed.
    #[error(transparent)]
    Bucket(#[from] BucketError),

    /// The suite could not write its output.
    #[error(transparent)]
    Suite(#[from] SuiteError),

    /// The run's output directory could not be set up.
    #[error("error setting up output directory `{path}`")]
    OutputDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The TAP file could not be copied to `--tapfile`.
    #[error("error copying TAP file to `{path}`")]
    CopyTap {
        /// The destination.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },
}

impl RunError {
    /// Returns true if this error was caused by the user's selection of tests.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::Filter(_) | Self::NoMatchingTests)
    }
}
