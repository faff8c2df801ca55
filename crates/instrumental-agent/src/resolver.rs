// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector hostname resolution and resolution-failure throttling.

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{future::Future, pin::Pin};

pub type ResolveFuture = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send>>;

pub type ResolverFn = Arc<dyn Fn(String, u16) -> ResolveFuture + Send + Sync>;

/// Looks up the collector address; swappable so tests can count lookups.
#[derive(Clone)]
pub struct Resolver {
    resolver_fn: ResolverFn,
}

impl Resolver {
    #[must_use]
    pub fn new(resolver_fn: ResolverFn) -> Self {
        Self { resolver_fn }
    }

    /// Resolves through the system resolver.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(|host: String, port: u16| -> ResolveFuture {
            Box::pin(async move {
                let addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
                Ok(addrs.collect())
            })
        }))
    }

    /// First IPv4 address for `host`, falling back to any address.
    pub async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let addrs = (self.resolver_fn)(host.to_string(), port).await?;
        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {host}"),
                )
            })
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::system()
    }
}

impl Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Resolver")
    }
}

/// Stops a DNS outage from turning every record call into a resolver round-trip.
///
/// After `failures_before_waiting` consecutive failures, a new attempt is only
/// allowed once `wait` has passed since the previous one.
#[derive(Debug, Clone)]
pub struct ResolutionThrottle {
    failures_before_waiting: u32,
    wait: Duration,
    consecutive_failures: u32,
    last_attempt: Option<Instant>,
}

impl ResolutionThrottle {
    #[must_use]
    pub fn new(failures_before_waiting: u32, wait: Duration) -> Self {
        Self {
            failures_before_waiting,
            wait,
            consecutive_failures: 0,
            last_attempt: None,
        }
    }

    #[must_use]
    pub fn should_attempt(&self, now: Instant) -> bool {
        if self.consecutive_failures < self.failures_before_waiting {
            return true;
        }
        match self.last_attempt {
            Some(last) => now.saturating_duration_since(last) >= self.wait,
            None => true,
        }
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
