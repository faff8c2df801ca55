// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Instrumental Agent
//!
//! Client-side telemetry agent. Application code records counters, gauges,
//! timings and notices through an [`Agent`]; the agent validates them, optionally
//! aggregates them into fixed time windows and ships them to a collector over a
//! persistent, authenticated line-protocol connection.
//!
//! Recording never blocks on the network and never panics into caller code.
//! Delivery happens on background workers that survive refused connections,
//! stalled sockets, DNS outages, TLS failures and process forks with bounded
//! memory and bounded exit latency.
//!
//! ## Pipeline
//!
//! ```text
//! caller ──► validation ──► aggregator queue ──► aggregator worker ──┐
//!                  └──────────────────────────► sender queue ◄───────┘
//!                                                     │
//!                                      sender worker (resolve, connect,
//!                                      hello/authenticate, stream lines)
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use instrumental_agent::{Agent, AgentConfig};
//!
//! let agent = Agent::new(AgentConfig {
//!     api_key: "project-token".to_string(),
//!     ..AgentConfig::default()
//! })
//! .expect("valid agent configuration");
//!
//! agent.increment("users.signups");
//! agent.gauge("queue.depth", 42.0);
//! let total = agent.time("reports.render", || 2 + 2);
//! assert_eq!(total, 4);
//!
//! // Part of the host's shutdown path.
//! agent.cleanup();
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod agent;
pub mod aggregator_service;
pub mod command;
pub mod config;
pub mod connection;
pub mod errors;
pub mod event_aggregator;
pub mod queue;
pub mod resolver;
pub mod sender;
pub mod tls;
pub mod util;

pub use agent::Agent;
pub use command::{Command, CommandKind, Notice};
pub use config::AgentConfig;
pub use event_aggregator::EventAggregator;
