// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Values that flow through the pipeline: metric commands and free-text notices.

use crate::errors::MergeError;
use std::fmt;
use ustr::Ustr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum CommandKind {
    #[display("increment")]
    Increment,
    #[display("gauge")]
    Gauge,
}

/// One metric observation, or several folded into one bucket.
///
/// `count` is the number of raw observations the command stands for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub metric: Ustr,
    pub value: f64,
    pub time: i64,
    pub count: u64,
}

impl Command {
    #[must_use]
    pub fn new(kind: CommandKind, metric: &str, value: f64, time: i64, count: u64) -> Self {
        Self {
            kind,
            metric: Ustr::from(metric),
            value,
            time,
            count,
        }
    }

    #[must_use]
    pub fn gauge(metric: &str, value: f64, time: i64) -> Self {
        Self::new(CommandKind::Gauge, metric, value, time, 1)
    }

    #[must_use]
    pub fn increment(metric: &str, value: f64, time: i64) -> Self {
        Self::new(CommandKind::Increment, metric, value, time, 1)
    }

    /// Identity used for merging. Kind is deliberately not part of it.
    #[must_use]
    pub fn bucket_key(&self) -> (Ustr, i64) {
        (self.metric, self.time)
    }

    /// Folds `other` into `self`, summing value and count.
    ///
    /// The kind of `other` wins, so `accumulator.merge(Some(&newest))` keeps the
    /// most recently applied kind. Merging with `None` returns `self` unchanged.
    pub fn merge(self, other: Option<&Command>) -> Result<Command, MergeError> {
        let Some(other) = other else {
            return Ok(self);
        };
        if self.bucket_key() != other.bucket_key() {
            return Err(MergeError::mismatch(self.bucket_key(), other.bucket_key()));
        }
        Ok(Command {
            kind: other.kind,
            metric: self.metric,
            value: self.value + other.value,
            time: self.time,
            count: self.count + other.count,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.kind, self.metric, self.value, self.time, self.count
        )
    }
}

/// A free-text event, never aggregated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub note: String,
    pub time: i64,
    pub duration: i64,
}

impl Notice {
    #[must_use]
    pub fn new(note: impl Into<String>, time: i64, duration: i64) -> Self {
        Self {
            note: note.into(),
            time,
            duration,
        }
    }

    /// A note must fit on a single protocol line.
    #[must_use]
    pub fn is_valid_note(note: &str) -> bool {
        !note.contains(['\n', '\r'])
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notice {} {} {}", self.time, self.duration, self.note)
    }
}
