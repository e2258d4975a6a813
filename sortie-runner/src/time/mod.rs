// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod pausable_sleep;
mod stopwatch;

pub(crate) use pausable_sleep::*;
pub(crate) use stopwatch::*;
