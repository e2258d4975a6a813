// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provision disposable machines, run integration tests against them, and triage the results.
//!
//! This crate is the `sortie` binary. The test-running machinery lives in `sortie-runner`; the
//! exit codes and report format live in `sortie-metadata`.

#![warn(missing_docs)]

mod builtin;
mod dispatch;
mod errors;
mod local;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{Color, OutputContext, Styles};
