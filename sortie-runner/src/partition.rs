// Copyright (c) The sortie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for sharding test runs across several machines.
//!
//! Shards are selected by hashing test names, so individual shards are stateless and every
//! invocation with the same inputs selects the same tests.

use crate::{errors::ShardingParseError, registry::RunnableSet};
use std::{fmt, str::FromStr};
use xxhash_rust::xxh64::xxh64;

/// Selects the subset of tests belonging to one shard out of several.
///
/// Parsed from strings of the form `hash:M/N`, where `M` counts up from 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sharding {
    shard_minus_one: u64,
    total_shards: u64,
}

impl Sharding {
    /// Creates a new `Sharding` for shard `shard` out of `total_shards`.
    pub fn new(shard: u64, total_shards: u64) -> Result<Self, ShardingParseError> {
        check_shard(shard, total_shards)?;
        Ok(Self {
            shard_minus_one: shard - 1,
            total_shards,
        })
    }

    /// The shard this is in, counting up from 1.
    pub fn shard(&self) -> u64 {
        self.shard_minus_one + 1
    }

    /// The total number of shards.
    pub fn total_shards(&self) -> u64 {
        self.total_shards
    }

    /// Returns true if the given test name belongs to this shard.
    pub fn test_matches(&self, test_name: &str) -> bool {
        xxh64(test_name.as_bytes(), 0) % self.total_shards == self.shard_minus_one
    }

    /// Returns the tests in `tests` that belong to this shard.
    pub fn select(&self, tests: RunnableSet) -> RunnableSet {
        tests
            .into_iter()
            .filter(|(name, _)| self.test_matches(name))
            .collect()
    }
}

impl fmt::Display for Sharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hash:{}/{}", self.shard(), self.total_shards)
    }
}

impl FromStr for Sharding {
    type Err = ShardingParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.strip_prefix("hash:").ok_or_else(|| {
            ShardingParseError::new(
                None,
                format!("sharding input '{s}' must begin with \"hash:\""),
            )
        })?;
        let (shard, total_shards) = parse_shards(input, "hash:M/N")?;
        Self::new(shard, total_shards)
    }
}

fn parse_shards(
    input: &str,
    expected_format: &'static str,
) -> Result<(u64, u64), ShardingParseError> {
    let Some((shard_str, total_shards_str)) = input.split_once('/') else {
        return Err(ShardingParseError::new(
            Some(expected_format),
            format!("expected input '{input}' to be in the format M/N"),
        ));
    };

    let shard: u64 = shard_str.parse().map_err(|err| {
        ShardingParseError::new(
            Some(expected_format),
            format!("failed to parse shard '{shard_str}' as u64: {err}"),
        )
    })?;

    let total_shards: u64 = total_shards_str.parse().map_err(|err| {
        ShardingParseError::new(
            Some(expected_format),
            format!("failed to parse total_shards '{total_shards_str}' as u64: {err}"),
        )
    })?;

    Ok((shard, total_shards))
}

fn check_shard(shard: u64, total_shards: u64) -> Result<(), ShardingParseError> {
    if !(1..=total_shards).contains(&shard) {
        return Err(ShardingParseError::new(
            Some("hash:M/N"),
            format!(
                "shard {shard} must be a number between 1 and total shards {total_shards}, inclusive"
            ),
        ));
    }
    Ok(())
}
