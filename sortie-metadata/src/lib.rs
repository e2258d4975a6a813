// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Sortie machine-readable output.
//!
//! Sortie writes a JSON report for every run into `<output-dir>/reports/report.json`, and exits
//! with one of a documented set of exit codes. This crate provides the types for both, so tools
//! consuming sortie output don't need to depend on the rest of the runner.

mod exit_codes;
mod report;

pub use exit_codes::*;
pub use report::*;
