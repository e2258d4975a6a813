// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for sortie, an integration test runner for operating system images.
//!
//! A run flows through [`test_filter`], [`denylist`], [`bucket`] and [`partition`] to produce
//! the set of tests to execute, which [`harness`] then runs as a tree of nodes against machines
//! provided by a [`platform::Flight`]. [`rerun`] decides what happens to failures afterwards.
//! [`run::TestRunner`] ties these together.

pub mod bucket;
pub mod conf;
pub mod config;
pub mod console;
pub mod denylist;
pub mod errors;
pub mod external;
pub mod harness;
pub mod partition;
pub mod platform;
pub mod registry;
pub mod reporter;
pub mod rerun;
pub mod run;
pub mod test_filter;
mod time;
