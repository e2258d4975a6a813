// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `sortie` failures.
///
/// `sortie` runs may fail for a variety of reasons. This structure documents the exit codes that
/// may occur in case of expected failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum SortieExitCode {}

impl SortieExitCode {
    /// No errors occurred and sortie exited normally.
    pub const OK: i32 = 0;

    /// No tests were selected to run, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 4;

    /// The only tests that failed were marked as warn-on-failure.
    ///
    /// This is distinct from both success and [`TEST_RUN_FAILED`](Self::TEST_RUN_FAILED).
    pub const TEST_RUN_WARNED: i32 = 77;

    /// A user-provided pattern or tag selection was invalid, or matched no tests.
    pub const INVALID_PATTERN: i32 = 94;

    /// A user issue happened while setting up a sortie invocation.
    pub const SETUP_ERROR: i32 = 96;

    /// One or more tests failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// Writing data to stdout, stderr or the output directory produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
