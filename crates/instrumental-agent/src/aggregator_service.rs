// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation worker: folds commands into per-window buckets and forwards
//! snapshots to the sender queue on window boundaries, flushes and exit.

use crate::event_aggregator::EventAggregator;
use crate::queue::{BoundedQueue, Message, QueueReceiver};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Time left until the next `frequency`-aligned window starts.
#[must_use]
pub fn time_to_next_window(frequency: u32, now: SystemTime) -> Option<Duration> {
    if frequency == 0 {
        return None;
    }
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let period = u128::from(frequency) * 1_000_000_000;
    let into_window = since_epoch.as_nanos() % period;
    let remaining = u64::try_from(period - into_window).unwrap_or(u64::MAX);
    Some(Duration::from_nanos(remaining))
}

fn next_window_deadline(frequency: u32) -> Option<Instant> {
    time_to_next_window(frequency, SystemTime::now()).map(|wait| Instant::now() + wait)
}

pub struct AggregatorService {
    receiver: QueueReceiver,
    sender_queue: Arc<BoundedQueue>,
    frequency: Arc<AtomicU32>,
    max_aggregator_size: usize,
    buffered: Arc<AtomicUsize>,
    cancel: CancellationToken,
    aggregator: Option<EventAggregator>,
}

impl AggregatorService {
    #[must_use]
    pub fn new(
        receiver: QueueReceiver,
        sender_queue: Arc<BoundedQueue>,
        frequency: Arc<AtomicU32>,
        max_aggregator_size: usize,
        buffered: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            sender_queue,
            frequency,
            max_aggregator_size,
            buffered,
            cancel,
            aggregator: None,
        }
    }

    pub async fn run(mut self) {
        debug!("Aggregator service started");
        let receiver = Arc::clone(&self.receiver);
        let mut rx = receiver.lock().await;

        let mut window_frequency = self.frequency.load(Ordering::Relaxed);
        let mut deadline = next_window_deadline(window_frequency);

        loop {
            let frequency = self.frequency.load(Ordering::Relaxed);
            if frequency != window_frequency {
                window_frequency = frequency;
                deadline = next_window_deadline(frequency);
            }

            // Boundary first, so a steady stream of commands cannot starve it.
            let next = match deadline {
                Some(at) => tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break,
                    () = sleep_until(at) => None,
                    message = rx.recv() => Some(message),
                },
                None => tokio::select! {
                    () = self.cancel.cancelled() => break,
                    message = rx.recv() => Some(message),
                },
            };

            match next {
                None => {
                    if self.sender_queue.is_empty() {
                        self.forward().await;
                    } else {
                        debug!(
                            "Sender queue busy ({}), deferring aggregator forward",
                            self.sender_queue.len()
                        );
                    }
                    deadline = next_window_deadline(frequency);
                }
                Some(None) => {
                    debug!("Aggregator queue closed");
                    break;
                }
                Some(Some(Message::Command(command))) => {
                    if frequency == 0 {
                        self.send(Message::Command(command)).await;
                        continue;
                    }
                    let aggregator = self
                        .aggregator
                        .get_or_insert_with(|| EventAggregator::new(frequency));
                    if let Err(e) = aggregator.put(command) {
                        error!("Failed to aggregate {}: {}", command, e);
                    }
                    let size = aggregator.size();
                    self.buffered.store(size, Ordering::Relaxed);
                    if size > self.max_aggregator_size {
                        debug!("Aggregator reached {} buckets, forwarding early", size);
                        self.forward().await;
                    }
                }
                Some(Some(Message::Batch(commands))) => {
                    self.send(Message::Batch(commands)).await;
                }
                Some(Some(Message::Notice(notice))) => {
                    self.send(Message::Notice(notice)).await;
                }
                Some(Some(Message::Flush(request))) => {
                    self.forward().await;
                    self.send(Message::Flush(request)).await;
                }
                Some(Some(Message::Exit)) => {
                    self.forward().await;
                    self.send(Message::Exit).await;
                    break;
                }
            }
        }

        debug!("Aggregator service stopped");
    }

    /// Hands the current snapshot to the sender and starts a fresh window.
    async fn forward(&mut self) {
        let Some(aggregator) = self.aggregator.take() else {
            return;
        };
        self.buffered.store(0, Ordering::Relaxed);
        if aggregator.is_empty() {
            return;
        }
        let commands = aggregator.into_commands();
        debug!("Forwarding {} aggregated commands", commands.len());
        self.send(Message::Batch(commands)).await;
    }

    async fn send(&self, message: Message) {
        if self.sender_queue.push(message).await.is_err() {
            error!("Sender queue closed, dropping aggregated data");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandKind, Notice};
    use crate::queue::{drain, FlushRequest};

    struct Harness {
        aggregator_queue: BoundedQueue,
        sender_queue: Arc<BoundedQueue>,
        sender_rx: QueueReceiver,
        buffered: Arc<AtomicUsize>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(frequency: u32, max_aggregator_size: usize) -> Harness {
        let (aggregator_queue, aggregator_rx) = BoundedQueue::new("aggregator", 100);
        let (sender_queue, sender_rx) = BoundedQueue::new("sender", 100);
        let sender_queue = Arc::new(sender_queue);
        let buffered = Arc::new(AtomicUsize::new(0));
        let service = AggregatorService::new(
            aggregator_rx,
            Arc::clone(&sender_queue),
            Arc::new(AtomicU32::new(frequency)),
            max_aggregator_size,
            Arc::clone(&buffered),
            CancellationToken::new(),
        );
        Harness {
            aggregator_queue,
            sender_queue,
            sender_rx,
            buffered,
            task: tokio::spawn(service.run()),
        }
    }

    fn batches(messages: &[Message]) -> Vec<Vec<Command>> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Batch(commands) => Some(commands.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_time_to_next_window() {
        let at = |secs: u64, millis: u64| {
            UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_millis(millis)
        };
        assert_eq!(time_to_next_window(0, at(1000, 0)), None);
        assert_eq!(
            time_to_next_window(10, at(1000, 0)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            time_to_next_window(10, at(1003, 500)),
            Some(Duration::from_millis(6500))
        );
        assert_eq!(
            time_to_next_window(60, at(1019, 0)),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn test_flush_forwards_snapshot_before_marker() {
        let harness = start(60, 5000);
        for _ in 0..2 {
            harness
                .aggregator_queue
                .try_push(Message::Command(Command::increment("users", 1.0, 1000)))
                .expect("push");
        }
        let (request, latch) = FlushRequest::new(false);
        harness
            .aggregator_queue
            .try_push(Message::Flush(request))
            .expect("push");
        harness.aggregator_queue.try_push(Message::Exit).expect("push");
        harness.task.await.expect("aggregator task");

        let messages = drain(&harness.sender_rx);
        assert!(matches!(messages[0], Message::Batch(_)));
        assert!(matches!(messages[1], Message::Flush(_)));
        assert!(matches!(messages[2], Message::Exit));
        assert_eq!(
            batches(&messages),
            vec![vec![Command::new(CommandKind::Increment, "users", 2.0, 960, 2)]]
        );
        assert!(!latch.is_released(), "only the sender releases the flush");
        drop(messages);
        assert!(latch.is_released());
    }

    #[tokio::test]
    async fn test_notices_are_not_aggregated() {
        let harness = start(60, 5000);
        for note in ["first", "second"] {
            harness
                .aggregator_queue
                .try_push(Message::Notice(Notice::new(note, 10, 0)))
                .expect("push");
        }
        harness.aggregator_queue.try_push(Message::Exit).expect("push");
        harness.task.await.expect("aggregator task");

        let notes: Vec<String> = drain(&harness.sender_rx)
            .into_iter()
            .filter_map(|m| match m {
                Message::Notice(notice) => Some(notice.note),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_size_cap_forces_forward() {
        let harness = start(60, 2);
        let push_gauge = |i: usize| {
            harness
                .aggregator_queue
                .try_push(Message::Command(Command::gauge(&format!("m{i}"), 1.0, 0)))
                .expect("push");
        };
        push_gauge(0);
        push_gauge(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.sender_queue.len(), 0, "reaching the cap keeps buckets");
        assert_eq!(harness.buffered.load(Ordering::Relaxed), 2);

        push_gauge(2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.sender_queue.len(), 1);
        assert_eq!(harness.buffered.load(Ordering::Relaxed), 0);

        harness.aggregator_queue.try_push(Message::Exit).expect("push");
        harness.task.await.expect("aggregator task");
        let messages = drain(&harness.sender_rx);
        assert_eq!(batches(&messages).len(), 1);
        assert_eq!(batches(&messages)[0].len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_window_boundaries_fire_under_steady_load() {
        let harness = start(1, 1_000_000);
        let sender_rx = Arc::clone(&harness.sender_rx);
        let consumer = tokio::spawn(async move {
            let mut rx = sender_rx.lock().await;
            let mut forwarded = 0;
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Batch(_) => forwarded += 1,
                    Message::Exit => break,
                    _ => {}
                }
            }
            forwarded
        });

        let started = std::time::Instant::now();
        let mut pushed = 0_u64;
        while started.elapsed() < Duration::from_millis(3500) {
            for _ in 0..10 {
                harness
                    .aggregator_queue
                    .push(Message::Command(Command::increment("busy", 1.0, 0)))
                    .await
                    .expect("push");
                pushed += 1;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        harness
            .aggregator_queue
            .push(Message::Exit)
            .await
            .expect("push");
        harness.task.await.expect("aggregator task");

        let forwarded = consumer.await.expect("consumer task");
        assert!(pushed > 3500, "only {pushed} commands pushed");
        assert!(forwarded >= 3, "{forwarded} batches over 3.5 one-second windows");
    }

    #[tokio::test]
    async fn test_window_boundary_forwards_when_sender_idle() {
        let harness = start(1, 5000);
        harness
            .aggregator_queue
            .try_push(Message::Command(Command::gauge("load", 1.0, 0)))
            .expect("push");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(harness.sender_queue.len(), 1);

        harness.aggregator_queue.try_push(Message::Exit).expect("push");
        harness.task.await.expect("aggregator task");
        assert_eq!(batches(&drain(&harness.sender_rx)).len(), 1);
    }

    #[tokio::test]
    async fn test_zero_frequency_passes_commands_through() {
        let harness = start(0, 5000);
        harness
            .aggregator_queue
            .try_push(Message::Command(Command::gauge("load", 1.0, 7)))
            .expect("push");
        harness.aggregator_queue.try_push(Message::Exit).expect("push");
        harness.task.await.expect("aggregator task");

        let messages = drain(&harness.sender_rx);
        assert!(matches!(
            messages[0],
            Message::Command(Command { time: 7, .. })
        ));
    }
}
