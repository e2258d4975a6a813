// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::Styles;
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use sortie_metadata::SortieExitCode;
use sortie_runner::{errors::*, run::NO_HEADING_TARGET};
use std::{error::Error, path::PathBuf};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are printed out with display_to_stderr, which
// adds context and colors.

/// An expected failure: bad input, a broken environment, or a failing collaborator.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine current directory")]
    CurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirInvalidUtf8 { path: PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("denylist parse error")]
    DenylistParseError {
        #[from]
        err: DenylistParseError,
    },
    #[error("invalid denylist pattern")]
    DenyPatternError {
        #[source]
        err: PatternError,
    },
    #[error("sharding parse error")]
    ShardingParseError {
        #[from]
        err: ShardingParseError,
    },
    #[error("test registration error")]
    RegistrationError {
        #[from]
        err: RegistrationError,
    },
    #[error("external test error")]
    ExternalTestError {
        dir: Utf8PathBuf,
        #[source]
        err: ExternalTestError,
    },
    #[error("report read error")]
    ReportReadError {
        #[from]
        err: ReportReadError,
    },
    #[error("test run error")]
    RunError {
        #[from]
        err: RunError,
    },
    #[error("error creating async runtime")]
    RuntimeCreateError {
        #[source]
        err: std::io::Error,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
    #[error("error serializing test list")]
    ListSerializeError {
        #[source]
        err: serde_json::Error,
    },
}

impl ExpectedError {
    pub(crate) fn deny_pattern(err: PatternError) -> Self {
        Self::DenyPatternError { err }
    }

    pub(crate) fn external_test(dir: Utf8PathBuf, err: ExternalTestError) -> Self {
        Self::ExternalTestError { dir, err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::DenyPatternError { .. } => SortieExitCode::INVALID_PATTERN,
            Self::RunError { err } if err.is_usage_error() => SortieExitCode::INVALID_PATTERN,
            Self::RunError {
                err: RunError::Bucket(_),
            } => SortieExitCode::SETUP_ERROR,
            Self::RunError { .. } | Self::WriteOutputError { .. } | Self::ListSerializeError { .. } => {
                SortieExitCode::WRITE_OUTPUT_ERROR
            }
            Self::CurrentDirFailed { .. }
            | Self::CurrentDirInvalidUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::DenylistParseError { .. }
            | Self::ShardingParseError { .. }
            | Self::RegistrationError { .. }
            | Self::ExternalTestError { .. }
            | Self::ReportReadError { .. }
            | Self::RuntimeCreateError { .. } => SortieExitCode::SETUP_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &Styles) {
        let mut next_error = match self {
            Self::CurrentDirFailed { err } => {
                error!("could not determine current directory");
                Some(err as &dyn Error)
            }
            Self::CurrentDirInvalidUtf8 { path } => {
                error!(
                    "current directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse sortie config at `{}`",
                    err.config_file().style(styles.bold)
                );
                err.source()
            }
            Self::DenylistParseError { err } => {
                error!("failed to load denylist");
                Some(err as &dyn Error)
            }
            Self::DenyPatternError { err } => {
                error!(
                    "invalid --denylist-test pattern `{}`",
                    err.pattern().style(styles.bold)
                );
                err.source()
            }
            Self::ShardingParseError { err } => {
                error!("failed to parse --sharding");
                Some(err as &dyn Error)
            }
            Self::RegistrationError { err } => {
                error!("{err}");
                None
            }
            Self::ExternalTestError { dir, err } => {
                error!(
                    "failed to register external tests from `{}`",
                    dir.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::ReportReadError { err } => {
                error!("failed to read previous run's report");
                Some(err as &dyn Error)
            }
            Self::RunError { err } => {
                error!("{err}");
                err.source()
            }
            Self::RuntimeCreateError { err } => {
                error!("error creating async runtime");
                Some(err as &dyn Error)
            }
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
            Self::ListSerializeError { err } => {
                error!("error serializing test list to JSON");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use test_case::test_case;

    fn usage() -> ExpectedError {
        RunError::NoMatchingTests.into()
    }

    fn setup() -> ExpectedError {
        sortie_runner::partition::Sharding::from_str("hash:0/2")
            .unwrap_err()
            .into()
    }

    fn write() -> ExpectedError {
        ExpectedError::WriteOutputError {
            err: std::io::Error::other("disk full"),
        }
    }

    #[test_case(usage(), SortieExitCode::INVALID_PATTERN ; "no matching tests")]
    #[test_case(setup(), SortieExitCode::SETUP_ERROR ; "bad sharding")]
    #[test_case(write(), SortieExitCode::WRITE_OUTPUT_ERROR ; "write failure")]
    fn exit_codes(error: ExpectedError, code: i32) {
        assert_eq!(error.process_exit_code(), code);
    }
}
