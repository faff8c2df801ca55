// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-window batching of commands before transmission.

use crate::command::Command;
use crate::errors::MergeError;
use fnv::FnvHasher;
use hashbrown::HashMap;
use std::hash::BuildHasherDefault;
use ustr::Ustr;

/// Window widths (seconds) the collector understands. They all divide a minute.
pub const VALID_FREQUENCIES: [u32; 13] = [0, 1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60];

pub const DEFAULT_FREQUENCY: u32 = 30;

/// Snaps a requested frequency down to the closest valid window width.
#[must_use]
pub fn snap_frequency(requested: u32) -> u32 {
    VALID_FREQUENCIES
        .iter()
        .copied()
        .filter(|f| *f <= requested)
        .max()
        .unwrap_or(0)
}

type BucketMap = HashMap<(Ustr, i64), Command, BuildHasherDefault<FnvHasher>>;

/// Accumulates one command per (metric, window) pair.
///
/// Owned by the aggregation worker only; never shared between threads.
#[derive(Debug, Clone)]
pub struct EventAggregator {
    frequency: u32,
    values: BucketMap,
}

impl EventAggregator {
    #[must_use]
    pub fn new(frequency: u32) -> Self {
        Self {
            frequency,
            values: BucketMap::default(),
        }
    }

    #[must_use]
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Start of the window `time` falls in.
    #[must_use]
    pub fn coerce_time(&self, time: i64) -> i64 {
        if self.frequency == 0 {
            return time;
        }
        time - time.rem_euclid(i64::from(self.frequency))
    }

    pub fn put(&mut self, mut command: Command) -> Result<(), MergeError> {
        command.time = self.coerce_time(command.time);
        let key = command.bucket_key();
        let merged = match self.values.get(&key) {
            Some(existing) => existing.merge(Some(&command))?,
            None => command,
        };
        self.values.insert(key, merged);
        Ok(())
    }

    /// Number of distinct buckets currently held.
    #[must_use]
    pub fn size(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Command> {
        self.values.values()
    }

    #[must_use]
    pub fn get(&self, metric: &str, time: i64) -> Option<&Command> {
        self.values.get(&(Ustr::from(metric), self.coerce_time(time)))
    }

    /// Consumes the aggregator, yielding its buckets in no particular order.
    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.values.into_values().collect()
    }
}
