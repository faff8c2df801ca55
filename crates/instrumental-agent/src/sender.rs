// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sender worker: resolve, connect, handshake, then stream queued messages.
//!
//! ```text
//! Stopped -> Resolving -> Connecting -> Handshaking -> Ready
//!               ^                                        |
//!               +--------- failure + backoff ------------+
//! ```
//!
//! A failed resolution, a refused connection, or a failure while reconnects
//! are disallowed ends the worker. The agent restarts it on the next record
//! call.

use crate::config::CollectorAddress;
use crate::connection::{ConnectOptions, Connection, Hello};
use crate::errors::{ConnectionError, ErrorKind};
use crate::queue::{BoundedQueue, Message, QueueReceiver};
use crate::resolver::{ResolutionThrottle, Resolver};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKOFF: f64 = 2.0;

/// `min((failures - 1) ^ 2, max)` seconds.
#[must_use]
pub fn backoff_delay(failures: u32, max: Duration) -> Duration {
    let exponent = f64::from(failures.saturating_sub(1)).powf(BACKOFF);
    Duration::from_secs_f64(exponent.min(max.as_secs_f64()))
}

/// Connection state shared between the sender worker and the agent.
#[derive(Debug)]
pub struct SenderState {
    failures: AtomicU32,
    connected: AtomicBool,
    allow_reconnect: AtomicBool,
    throttle: Mutex<ResolutionThrottle>,
}

impl SenderState {
    #[must_use]
    pub fn new(throttle: ResolutionThrottle) -> Self {
        Self {
            failures: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            allow_reconnect: AtomicBool::new(true),
            throttle: Mutex::new(throttle),
        }
    }

    /// Consecutive connection failures since the last successful handshake.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Cleared while the agent shuts down, so failures end the worker.
    pub fn set_allow_reconnect(&self, allow: bool) {
        self.allow_reconnect.store(allow, Ordering::Relaxed);
    }

    #[must_use]
    pub fn allows_reconnect(&self) -> bool {
        self.allow_reconnect.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn may_resolve(&self, now: Instant) -> bool {
        self.throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_attempt(now)
    }

    fn with_throttle<T>(&self, f: impl FnOnce(&mut ResolutionThrottle) -> T) -> T {
        f(&mut self.throttle.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub address: CollectorAddress,
    pub api_key: String,
    pub verify_cert: bool,
    pub resolve_timeout: Duration,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub exit_flush_timeout: Duration,
    pub max_reconnect_delay: Duration,
}

impl SenderConfig {
    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.address.host.clone(),
            secure: self.address.secure,
            verify_cert: self.verify_cert,
            connect_timeout: self.connect_timeout,
            reply_timeout: self.reply_timeout,
        }
    }
}

/// A failed session and the message that was being written, if any.
struct SessionFailure {
    error: ConnectionError,
    in_flight: Option<Message>,
}

impl From<ConnectionError> for SessionFailure {
    fn from(error: ConnectionError) -> Self {
        Self {
            error,
            in_flight: None,
        }
    }
}

pub struct SenderService {
    config: SenderConfig,
    receiver: QueueReceiver,
    queue: Arc<BoundedQueue>,
    resolver: Resolver,
    state: Arc<SenderState>,
    cancel: CancellationToken,
    pending: Option<Message>,
}

impl SenderService {
    #[must_use]
    pub fn new(
        config: SenderConfig,
        receiver: QueueReceiver,
        queue: Arc<BoundedQueue>,
        resolver: Resolver,
        state: Arc<SenderState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            receiver,
            queue,
            resolver,
            state,
            cancel,
            pending: None,
        }
    }

    pub async fn run(mut self) {
        debug!("Sender service started");
        let receiver = Arc::clone(&self.receiver);
        let mut rx = receiver.lock().await;

        // A restart after failures still honours the backoff.
        let failures = self.state.failures();
        if failures > 0 && !self.pause(failures).await {
            return;
        }

        loop {
            let Some(addr) = self.resolve().await else {
                info!(
                    "Collector address unavailable, sender stopped with {} messages queued",
                    self.queue.len()
                );
                break;
            };

            match self.connect_and_stream(addr, &mut rx).await {
                Ok(()) => break,
                Err(failure) => {
                    if !self.handle_failure(failure).await {
                        break;
                    }
                }
            }
        }

        self.state.connected.store(false, Ordering::Relaxed);
        debug!("Sender service stopped");
    }

    async fn resolve(&self) -> Option<SocketAddr> {
        let host = &self.config.address.host;
        let port = self.config.address.port;
        let now = Instant::now();
        let allowed = self.state.with_throttle(|throttle| {
            let allowed = throttle.should_attempt(now);
            if allowed {
                throttle.record_attempt(now);
            }
            allowed
        });
        if !allowed {
            debug!("Skipping resolution of {}, waiting after repeated failures", host);
            return None;
        }

        let result = timeout(self.config.resolve_timeout, self.resolver.resolve(host, port)).await;
        match result {
            Ok(Ok(addr)) => {
                self.state.with_throttle(ResolutionThrottle::record_success);
                Some(addr)
            }
            Ok(Err(e)) => {
                self.state.with_throttle(ResolutionThrottle::record_failure);
                warn!("Couldn't resolve address for {}:{}: {}", host, port, e);
                None
            }
            Err(_) => {
                self.state.with_throttle(ResolutionThrottle::record_failure);
                warn!("Timed out resolving address for {}:{}", host, port);
                None
            }
        }
    }

    async fn connect_and_stream(
        &mut self,
        addr: SocketAddr,
        rx: &mut mpsc::Receiver<Message>,
    ) -> Result<(), SessionFailure> {
        info!("Connecting to collector at {}", addr);
        let mut connection = Connection::open(addr, &self.config.connect_options()).await?;
        let result = self.session(&mut connection, rx).await;
        self.state.connected.store(false, Ordering::Relaxed);
        connection.close(self.config.exit_flush_timeout).await;
        result
    }

    async fn session(
        &mut self,
        connection: &mut Connection,
        rx: &mut mpsc::Receiver<Message>,
    ) -> Result<(), SessionFailure> {
        connection
            .handshake(
                &Hello::for_current_process(),
                &self.config.api_key,
                self.config.reply_timeout,
            )
            .await?;
        self.state.failures.store(0, Ordering::Relaxed);
        self.state.connected.store(true, Ordering::Relaxed);
        info!("Connected to collector at {}", connection.peer());

        loop {
            let message = match self.pending.take() {
                Some(message) => message,
                None => tokio::select! {
                    () = self.cancel.cancelled() => return Ok(()),
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => return Ok(()),
                    },
                },
            };

            if let Err(error) = connection.probe().await {
                return Err(SessionFailure {
                    error,
                    in_flight: Some(message),
                });
            }

            match Self::dispatch(connection, &message).await {
                Ok(true) => {
                    info!("Exiting, {} commands remain", self.queue.len());
                    return Ok(());
                }
                // Dropping a flush marker here wakes whoever waits on it
                Ok(false) => drop(message),
                Err(error) => {
                    return Err(SessionFailure {
                        error,
                        in_flight: Some(message),
                    })
                }
            }
        }
    }

    /// Writes one message. Returns whether the worker should exit.
    async fn dispatch(
        connection: &mut Connection,
        message: &Message,
    ) -> Result<bool, ConnectionError> {
        match message {
            Message::Command(command) => {
                debug!("Sending: {}", command);
                connection.write_line(&command.to_string()).await?;
            }
            Message::Notice(notice) => {
                debug!("Sending: {}", notice);
                connection.write_line(&notice.to_string()).await?;
            }
            Message::Batch(commands) => {
                debug!("Sending batch of {} commands", commands.len());
                for command in commands {
                    connection.write_line(&command.to_string()).await?;
                }
            }
            Message::Flush(_) => {}
            Message::Exit => {
                connection.flush().await?;
                return Ok(true);
            }
        }
        connection.flush().await?;
        Ok(false)
    }

    /// Records the failure and sleeps off the backoff. Returns whether to reconnect.
    async fn handle_failure(&mut self, failure: SessionFailure) -> bool {
        let SessionFailure { error, in_flight } = failure;
        self.state.connected.store(false, Ordering::Relaxed);
        let failures = self.state.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut allow_reconnect = self.state.allows_reconnect() && error.kind.is_recoverable();

        match error.kind {
            ErrorKind::Closed => debug!("Collector connection lost: {}", error),
            ErrorKind::Refused => error!(
                "Unable to connect to collector, hanging up with {} messages remaining",
                self.queue.len()
            ),
            _ => error!("Collector connection failed: {}", error),
        }

        if let Some(message) = in_flight {
            let flush_without_reconnect =
                matches!(&message, Message::Flush(request) if !request.allow_reconnect);
            if flush_without_reconnect {
                allow_reconnect = false;
            } else if allow_reconnect {
                debug!("Requeueing in-flight message");
                self.pending = Some(message);
            } else {
                debug!("Dropping in-flight message");
            }
        }

        if !allow_reconnect {
            info!(
                "Disconnected after {} failures, not reconnecting",
                failures
            );
            return false;
        }
        self.pause(failures).await
    }

    async fn pause(&self, failures: u32) -> bool {
        let delay = backoff_delay(failures, self.config.max_reconnect_delay);
        error!(
            "Disconnected, {} failures in a row, reconnect in {:?}...",
            failures, delay
        );
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = sleep(delay) => true,
        }
    }
}
