// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded queues between callers and workers, and the messages they carry.

use crate::command::{Command, Notice};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum Message {
    Command(Command),
    Notice(Notice),
    /// A forwarded aggregator snapshot
    Batch(Vec<Command>),
    Flush(FlushRequest),
    Exit,
}

impl Message {
    /// Number of metric lines this message puts on the wire.
    #[must_use]
    pub fn weight(&self) -> usize {
        match self {
            Message::Command(_) | Message::Notice(_) => 1,
            Message::Batch(commands) => commands.len(),
            Message::Flush(_) | Message::Exit => 0,
        }
    }
}

/// One-shot signal a caller thread can block on.
#[derive(Debug, Default)]
pub struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        *released = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the latch was released before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            released = self
                .cond
                .wait_timeout(released, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Barrier marker. Whoever ends up dropping it wakes the waiting caller, so a
/// flush can never outlive the message that carries it.
#[derive(Debug)]
pub struct FlushRequest {
    latch: Arc<Latch>,
    pub allow_reconnect: bool,
}

impl FlushRequest {
    #[must_use]
    pub fn new(allow_reconnect: bool) -> (Self, Arc<Latch>) {
        let latch = Latch::new();
        (
            Self {
                latch: Arc::clone(&latch),
                allow_reconnect,
            },
            latch,
        )
    }
}

impl Drop for FlushRequest {
    fn drop(&mut self) {
        self.latch.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

pub type QueueReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>;

/// Producer side of a bounded FIFO. Inserts beyond capacity are dropped.
#[derive(Debug)]
pub struct BoundedQueue {
    name: &'static str,
    tx: mpsc::Sender<Message>,
    overflowing: AtomicBool,
    dropped: AtomicU64,
}

impl BoundedQueue {
    /// The receiver is shared so a restarted worker can pick up where the
    /// previous one stopped.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name,
                tx,
                overflowing: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            },
            Arc::new(tokio::sync::Mutex::new(rx)),
        )
    }

    pub fn try_push(&self, message: Message) -> Result<(), PushError> {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.overflowing.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(message)) => {
                self.dropped
                    .fetch_add(message.weight() as u64, Ordering::Relaxed);
                if !self.overflowing.swap(true, Ordering::Relaxed) {
                    warn!("Queue full({}) for {}, dropping commands...", self.len(), self.name);
                }
                debug!("Dropping command, {} queue full: {:?}", self.name, message);
                Err(PushError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Like [`BoundedQueue::try_push`], but hands the message back when full
    /// and does not count it as dropped.
    pub fn offer(&self, message: Message) -> Result<(), Option<Message>> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => Err(Some(message)),
            Err(TrySendError::Closed(_)) => Err(None),
        }
    }

    /// Waits for capacity instead of dropping. Only workers call this.
    pub async fn push(&self, message: Message) -> Result<(), PushError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| PushError::Closed)?;
        self.overflowing.store(false, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Commands dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) fn drain(receiver: &QueueReceiver) -> Vec<Message> {
    let mut rx = receiver.try_lock().expect("no worker holds the receiver");
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
