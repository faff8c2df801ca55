// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Public recording API and the per-process worker pipeline behind it.

use crate::aggregator_service::AggregatorService;
use crate::command::{Command, CommandKind, Notice};
use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::event_aggregator::snap_frequency;
use crate::queue::{BoundedQueue, FlushRequest, Latch, Message, QueueReceiver};
use crate::resolver::{ResolutionThrottle, Resolver};
use crate::sender::{SenderConfig, SenderService, SenderState};
use crate::util::{unix_now, valid_metric_name, valid_metric_value};
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const WORKER_THREADS: usize = 2;

/// Releases the latch when the worker task ends, however it ends.
struct ExitSignal(Arc<Latch>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct Worker {
    task: JoinHandle<()>,
    exited: Arc<Latch>,
}

impl Worker {
    fn spawn<F>(handle: &Handle, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let exited = Latch::new();
        let signal = ExitSignal(Arc::clone(&exited));
        let task = handle.spawn(async move {
            let _signal = signal;
            future.await;
        });
        Self { task, exited }
    }

    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Default)]
struct Workers {
    sender: Option<Worker>,
    aggregator: Option<Worker>,
}

/// Queues, workers and runtime owned by one process id.
struct Pipeline {
    pid: u32,
    runtime: Mutex<Option<Runtime>>,
    cancel: CancellationToken,
    aggregator_queue: Arc<BoundedQueue>,
    aggregator_rx: QueueReceiver,
    sender_queue: Arc<BoundedQueue>,
    sender_rx: QueueReceiver,
    buffered: Arc<AtomicUsize>,
    state: Arc<SenderState>,
    workers: Mutex<Workers>,
    sender_config: SenderConfig,
    resolver: Resolver,
    frequency: Arc<AtomicU32>,
    max_aggregator_size: usize,
}

impl Pipeline {
    fn new(
        config: &AgentConfig,
        sender_config: SenderConfig,
        resolver: Resolver,
        frequency: Arc<AtomicU32>,
    ) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("instrumental-agent")
            .enable_all()
            .build()?;
        let (aggregator_queue, aggregator_rx) = BoundedQueue::new("aggregator", config.max_buffer);
        let (sender_queue, sender_rx) = BoundedQueue::new("sender", config.max_buffer);
        let throttle = ResolutionThrottle::new(
            config.resolution_failures_before_waiting,
            config.resolution_wait,
        );

        Ok(Self {
            pid: std::process::id(),
            runtime: Mutex::new(Some(runtime)),
            cancel: CancellationToken::new(),
            aggregator_queue: Arc::new(aggregator_queue),
            aggregator_rx,
            sender_queue: Arc::new(sender_queue),
            sender_rx,
            buffered: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(SenderState::new(throttle)),
            workers: Mutex::new(Workers::default()),
            sender_config,
            resolver,
            frequency,
            max_aggregator_size: config.max_aggregator_size,
        })
    }

    fn handle(&self) -> Option<Handle> {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|runtime| runtime.handle().clone())
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender_alive(&self) -> bool {
        self.workers().sender.as_ref().is_some_and(Worker::is_alive)
    }

    fn aggregator_alive(&self) -> bool {
        self.workers().aggregator.as_ref().is_some_and(Worker::is_alive)
    }

    /// Starts missing workers. A caller that finds another caller already
    /// starting them returns straight away.
    fn ensure_workers(&self, aggregate: bool) {
        let mut workers = match self.workers.try_lock() {
            Ok(workers) => workers,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        let Some(handle) = self.handle() else {
            return;
        };

        let sender_alive = workers.sender.as_ref().is_some_and(Worker::is_alive);
        if !sender_alive
            && self.state.allows_reconnect()
            && self.state.may_resolve(Instant::now())
        {
            debug!("Starting sender worker for pid {}", self.pid);
            let service = SenderService::new(
                self.sender_config.clone(),
                Arc::clone(&self.sender_rx),
                Arc::clone(&self.sender_queue),
                self.resolver.clone(),
                Arc::clone(&self.state),
                self.cancel.child_token(),
            );
            workers.sender = Some(Worker::spawn(&handle, service.run()));
        }

        let aggregator_alive = workers.aggregator.as_ref().is_some_and(Worker::is_alive);
        if aggregate && !aggregator_alive {
            debug!("Starting aggregator worker for pid {}", self.pid);
            let service = AggregatorService::new(
                Arc::clone(&self.aggregator_rx),
                Arc::clone(&self.sender_queue),
                Arc::clone(&self.frequency),
                self.max_aggregator_size,
                Arc::clone(&self.buffered),
                self.cancel.child_token(),
            );
            workers.aggregator = Some(Worker::spawn(&handle, service.run()));
        }
    }

    /// Messages waiting in either queue plus buckets held by the aggregator.
    fn pending(&self) -> usize {
        self.aggregator_queue.len() + self.sender_queue.len() + self.buffered.load(Ordering::Relaxed)
    }

    fn dropped(&self) -> u64 {
        self.aggregator_queue.dropped() + self.sender_queue.dropped()
    }

    /// Enqueues a flush marker and blocks until the sender has processed it
    /// or stopped running.
    fn barrier(&self, via_aggregator: bool, allow_reconnect: bool) {
        let (request, latch) = FlushRequest::new(allow_reconnect);
        let queue = if via_aggregator {
            &self.aggregator_queue
        } else {
            &self.sender_queue
        };

        let mut message = Message::Flush(request);
        loop {
            match queue.offer(message) {
                Ok(()) => break,
                Err(Some(returned)) => {
                    if !self.sender_alive() {
                        return;
                    }
                    message = returned;
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(None) => return,
            }
        }

        while !latch.wait_timeout(POLL_INTERVAL) {
            if !self.sender_alive() {
                debug!("Sender stopped before the flush completed");
                return;
            }
        }
    }

    /// Waits for both workers to finish. Returns false if `deadline` passed first.
    fn wait_for_exit(&self, deadline: Instant) -> bool {
        let latches: Vec<Arc<Latch>> = {
            let workers = self.workers();
            [workers.aggregator.as_ref(), workers.sender.as_ref()]
                .into_iter()
                .flatten()
                .map(|worker| Arc::clone(&worker.exited))
                .collect()
        };
        latches
            .iter()
            .all(|latch| latch.wait_timeout(deadline.saturating_duration_since(Instant::now())))
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(runtime) = runtime else {
            return;
        };
        if self.pid == std::process::id() {
            self.cancel.cancel();
            runtime.shutdown_background();
        } else {
            // Inherited across fork: its threads exist only in the parent.
            std::mem::forget(runtime);
        }
    }
}

/// Records metrics and notices and ships them to the collector in the background.
///
/// Every recording method is safe to call from any number of threads, never
/// blocks on the network (unless synchronous mode is on) and never panics.
/// Values are returned on success and `None` when the agent is disabled, the
/// input is invalid or the queue is full.
pub struct Agent {
    config: AgentConfig,
    sender_config: SenderConfig,
    resolver: Resolver,
    enabled: AtomicBool,
    synchronous: AtomicBool,
    frequency: Arc<AtomicU32>,
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    #[cfg(test)]
    fail_next_record: AtomicBool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("collector", &self.sender_config.address)
            .field("enabled", &self.is_enabled())
            .field("synchronous", &self.is_synchronous())
            .field("frequency", &self.frequency())
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        Self::with_resolver(config, Resolver::system())
    }

    /// Builds an agent from `INSTRUMENTAL_*` environment variables.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::new(AgentConfig::from_env()?)
    }

    pub fn with_resolver(config: AgentConfig, resolver: Resolver) -> Result<Self, AgentError> {
        let config = config.normalized();
        config.validate()?;
        let address = config.collector_address()?;
        info!(
            "Instrumental agent for {}:{} (enabled: {}, secure: {}, frequency: {}s)",
            address.host, address.port, config.enabled, address.secure, config.frequency
        );

        let sender_config = SenderConfig {
            address,
            api_key: config.api_key.clone(),
            verify_cert: config.verify_cert,
            resolve_timeout: config.resolve_timeout,
            connect_timeout: config.connect_timeout,
            reply_timeout: config.reply_timeout,
            exit_flush_timeout: config.exit_flush_timeout,
            max_reconnect_delay: config.max_reconnect_delay,
        };

        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            synchronous: AtomicBool::new(config.synchronous),
            frequency: Arc::new(AtomicU32::new(config.frequency)),
            config,
            sender_config,
            resolver,
            pipeline: RwLock::new(None),
            #[cfg(test)]
            fail_next_record: AtomicBool::new(false),
        })
    }

    pub fn gauge(&self, metric: &str, value: f64) -> Option<f64> {
        self.gauge_with(metric, value, unix_now(), 1)
    }

    pub fn gauge_with(&self, metric: &str, value: f64, time: i64, count: u64) -> Option<f64> {
        self.record(CommandKind::Gauge, metric, value, time, count)
    }

    pub fn increment(&self, metric: &str) -> Option<f64> {
        self.increment_by(metric, 1.0)
    }

    pub fn increment_by(&self, metric: &str, value: f64) -> Option<f64> {
        self.increment_with(metric, value, unix_now(), 1)
    }

    pub fn increment_with(&self, metric: &str, value: f64, time: i64, count: u64) -> Option<f64> {
        self.record(CommandKind::Increment, metric, value, time, count)
    }

    pub fn notice<'a>(&self, note: &'a str) -> Option<&'a str> {
        self.notice_with(note, unix_now(), 0)
    }

    /// Records a one-line event that started at `time` and lasted `duration` seconds.
    pub fn notice_with<'a>(&self, note: &'a str, time: i64, duration: i64) -> Option<&'a str> {
        self.guarded("notice", || {
            if !self.is_enabled() {
                return None;
            }
            if !Notice::is_valid_note(note) {
                warn!("Invalid notice {:?}, notes must fit on one line", note);
                return None;
            }
            self.enqueue(Message::Notice(Notice::new(note, time, duration)))
                .then_some(note)
        })
    }

    /// Runs `f` and records its wall-clock duration in seconds as a gauge.
    ///
    /// The gauge is recorded even if `f` panics; the panic is not caught.
    pub fn time<T>(&self, metric: &str, f: impl FnOnce() -> T) -> T {
        self.time_with_multiplier(metric, 1.0, f)
    }

    /// Same as [`Agent::time`], in milliseconds.
    pub fn time_ms<T>(&self, metric: &str, f: impl FnOnce() -> T) -> T {
        self.time_with_multiplier(metric, 1000.0, f)
    }

    pub fn time_with_multiplier<T>(&self, metric: &str, multiplier: f64, f: impl FnOnce() -> T) -> T {
        let _timer = Timer {
            agent: self,
            metric,
            multiplier,
            started: Instant::now(),
            started_at: unix_now(),
        };
        f()
    }

    /// Blocks until everything recorded before this call has been written to
    /// the collector, or until the sender stops running.
    ///
    /// With `allow_reconnect` off, returns immediately while disconnected and
    /// stops the sender if the connection fails during the flush.
    pub fn flush(&self, allow_reconnect: bool) {
        let _: Option<()> = self.guarded("flush", || {
            let pipeline = self.current_pipeline()?;
            if !pipeline.sender_alive() {
                return None;
            }
            if !allow_reconnect && pipeline.state.failures() > 0 {
                debug!("Not flushing while disconnected");
                return None;
            }
            pipeline.barrier(pipeline.aggregator_alive(), allow_reconnect);
            Some(())
        });
    }

    /// Kills both workers and discards everything queued.
    pub fn stop(&self) {
        let pipeline = self.slot_mut().take();
        if let Some(pipeline) = pipeline {
            info!(
                "Stopping agent, discarding {} queued messages",
                pipeline.pending()
            );
            pipeline.shutdown();
        }
    }

    /// Delivers what is queued, bounded by the exit flush timeout, then stops.
    pub fn cleanup(&self) {
        let Some(pipeline) = self.current_pipeline() else {
            return;
        };
        pipeline.state.set_allow_reconnect(false);

        let pending = pipeline.pending();
        if pipeline.sender_alive() && pending > 0 {
            info!("Cleaning up agent, queue size: {}", pending);
            let deadline = Instant::now() + self.config.exit_flush_timeout;
            let queue = if pipeline.aggregator_alive() {
                &pipeline.aggregator_queue
            } else {
                &pipeline.sender_queue
            };

            let mut message = Message::Exit;
            loop {
                match queue.offer(message) {
                    Err(Some(returned)) if Instant::now() < deadline => {
                        message = returned;
                        std::thread::sleep(POLL_INTERVAL);
                    }
                    _ => break,
                }
            }

            if !pipeline.wait_for_exit(deadline) {
                let remaining = pipeline.pending();
                if remaining > 0 {
                    error!(
                        "Timed out working agent thread on exit, dropping {} metrics",
                        remaining
                    );
                } else {
                    error!("Timed out waiting for agent workers on exit");
                }
            }
        }

        {
            let mut slot = self.slot_mut();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &pipeline)) {
                slot.take();
            }
        }
        pipeline.shutdown();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Synchronous mode turns aggregation off.
    pub fn set_synchronous(&self, synchronous: bool) {
        self.synchronous.store(synchronous, Ordering::Relaxed);
        if synchronous && self.frequency() > 0 {
            warn!(
                "Synchronous mode disables aggregation, ignoring frequency {}",
                self.frequency()
            );
            self.frequency.store(0, Ordering::Relaxed);
            self.release_aggregated();
        }
    }

    pub fn set_frequency(&self, frequency: u32) {
        let snapped = snap_frequency(frequency);
        if snapped != frequency {
            warn!(
                "Frequency {} is not supported, using {} instead",
                frequency, snapped
            );
        }
        if self.is_synchronous() && snapped > 0 {
            warn!("Synchronous mode disables aggregation, ignoring frequency {}", snapped);
            return;
        }
        if self.frequency.swap(snapped, Ordering::Relaxed) != snapped {
            self.release_aggregated();
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.synchronous.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frequency(&self) -> u32 {
        self.frequency.load(Ordering::Relaxed)
    }

    /// Whether a sender worker is alive for this process.
    #[must_use]
    pub fn running(&self) -> bool {
        self.current_pipeline()
            .is_some_and(|pipeline| pipeline.sender_alive())
    }

    /// Whether the sender has an authenticated collector connection.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.current_pipeline()
            .is_some_and(|pipeline| pipeline.state.is_connected())
    }

    /// Messages not yet handed to the collector connection.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.current_pipeline()
            .map_or(0, |pipeline| pipeline.pending())
    }

    /// Commands dropped because a queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.current_pipeline()
            .map_or(0, |pipeline| pipeline.dropped())
    }

    fn record(
        &self,
        kind: CommandKind,
        metric: &str,
        value: f64,
        time: i64,
        count: u64,
    ) -> Option<f64> {
        self.guarded(kind, || {
            if !self.is_enabled() || !self.valid(metric, value) {
                return None;
            }
            self.enqueue(Message::Command(Command::new(kind, metric, value, time, count)))
                .then_some(value)
        })
    }

    fn valid(&self, metric: &str, value: f64) -> bool {
        if !valid_metric_name(metric) {
            self.report_invalid("agent.invalid_metric");
            warn!("Invalid metric {}", metric);
            return false;
        }
        if !valid_metric_value(value) {
            self.report_invalid("agent.invalid_value");
            warn!("Invalid value {} for {}", value, metric);
            return false;
        }
        true
    }

    fn report_invalid(&self, metric: &str) {
        self.enqueue(Message::Command(Command::increment(metric, 1.0, unix_now())));
    }

    /// Routes a message into the pipeline, starting workers as needed.
    fn enqueue(&self, message: Message) -> bool {
        #[cfg(test)]
        self.inject_failure();

        let Some(pipeline) = self.pipeline() else {
            return false;
        };
        let synchronous = self.is_synchronous();
        let aggregate = !synchronous && self.frequency() > 0;
        pipeline.ensure_workers(aggregate);

        if synchronous {
            if pipeline.sender_queue.try_push(message).is_err() {
                return false;
            }
            pipeline.barrier(false, true);
            return true;
        }

        let queue = if aggregate {
            &pipeline.aggregator_queue
        } else {
            &pipeline.sender_queue
        };
        queue.try_push(message).is_ok()
    }

    #[cfg(test)]
    fn inject_failure(&self) {
        if self.fail_next_record.swap(false, Ordering::Relaxed) {
            panic!("injected record failure");
        }
    }

    /// Pushes whatever the aggregator holds to the sender without waiting.
    fn release_aggregated(&self) {
        if let Some(pipeline) = self.current_pipeline() {
            if pipeline.aggregator_alive() {
                let (request, _latch) = FlushRequest::new(true);
                let _ = pipeline.aggregator_queue.offer(Message::Flush(request));
            }
        }
    }

    fn guarded<T>(&self, operation: impl Display, f: impl FnOnce() -> Option<T>) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Exception occurred in {}: {}", operation, message);
                None
            }
        }
    }

    fn slot(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<Pipeline>>> {
        self.pipeline.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Pipeline>>> {
        self.pipeline.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The pipeline of this process, if one was started.
    fn current_pipeline(&self) -> Option<Arc<Pipeline>> {
        let pid = std::process::id();
        self.slot()
            .as_ref()
            .filter(|pipeline| pipeline.pid == pid)
            .map(Arc::clone)
    }

    /// The pipeline of this process, created on first use and after a fork.
    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        if let Some(pipeline) = self.current_pipeline() {
            return Some(pipeline);
        }

        let pid = std::process::id();
        let mut slot = self.slot_mut();
        match slot.as_ref() {
            Some(pipeline) if pipeline.pid == pid => return Some(Arc::clone(pipeline)),
            Some(pipeline) => {
                info!(
                    "Process id changed from {} to {}, starting a new pipeline",
                    pipeline.pid, pid
                );
            }
            None => {}
        }

        match Pipeline::new(
            &self.config,
            self.sender_config.clone(),
            self.resolver.clone(),
            Arc::clone(&self.frequency),
        ) {
            Ok(pipeline) => {
                let pipeline = Arc::new(pipeline);
                *slot = Some(Arc::clone(&pipeline));
                Some(pipeline)
            }
            Err(e) => {
                error!("Failed to start agent workers: {}", e);
                None
            }
        }
    }
}

/// Records the elapsed time as a gauge when dropped.
struct Timer<'a> {
    agent: &'a Agent,
    metric: &'a str,
    multiplier: f64,
    started: Instant,
    started_at: i64,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64() * self.multiplier;
        self.agent.gauge_with(self.metric, elapsed, self.started_at, 1);
    }
}
