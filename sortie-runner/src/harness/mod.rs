// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test tree executor.
//!
//! Every test runs as a node in a tree. A node's body can run sequential subtests inline with
//! [`H::run`], or register parallel subtests with [`H::run_parallel`], which start once the
//! body returns. A [`Suite`] owns the root of the tree and bounds how many nodes run in
//! parallel.

mod gate;
mod names;
mod node;
mod suite;

pub use gate::GateCounters;
pub use node::{H, TimerStart};
pub use suite::{
    REPORTS_DIR_NAME, Suite, SuiteOptions, SuiteSummary, SuiteTest, TAP_FILE_NAME, TestOutcome,
};

use futures::future::BoxFuture;

/// Why a test body stopped early.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestAbort {
    /// The test failed and stopped. Returned by [`H::fatal`].
    Failed,
    /// The test was skipped. Returned by [`H::skip`].
    Skipped,
}

/// The result of a test body.
pub type TestResult = Result<(), TestAbort>;

/// A node body, run once with the node's handle.
pub type HarnessFn = Box<dyn FnOnce(H) -> BoxFuture<'static, TestResult> + Send>;
