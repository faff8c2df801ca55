// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use crate::event_aggregator::{snap_frequency, DEFAULT_FREQUENCY};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_COLLECTOR_HOST: &str = "collector.instrumentalapp.com";
pub const DEFAULT_SECURE_PORT: u16 = 8001;
pub const DEFAULT_PLAIN_PORT: u16 = 8000;
pub const DEFAULT_MAX_BUFFER: usize = 5000;
pub const DEFAULT_MAX_AGGREGATOR_SIZE: usize = 5000;

/// Agent configuration. Unset fields fall back to [`AgentConfig::default`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Project token sent with `authenticate`
    pub api_key: String,
    /// `host[:port]` or `scheme://host[:port]` where scheme is `tcp`, `ssl` or `tls`
    pub collector: String,
    pub enabled: bool,
    /// Every record call waits until its command is written to the socket
    pub synchronous: bool,
    pub secure: bool,
    pub verify_cert: bool,
    /// Aggregation window in seconds, 0 disables aggregation
    pub frequency: u32,
    /// Capacity of each of the two queues
    pub max_buffer: usize,
    /// Bucket count that forces an early forward of the aggregator
    pub max_aggregator_size: usize,
    #[serde(skip)]
    pub resolve_timeout: Duration,
    #[serde(skip)]
    pub connect_timeout: Duration,
    #[serde(skip)]
    pub reply_timeout: Duration,
    #[serde(skip)]
    pub exit_flush_timeout: Duration,
    #[serde(skip)]
    pub max_reconnect_delay: Duration,
    pub resolution_failures_before_waiting: u32,
    #[serde(skip)]
    pub resolution_wait: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            collector: DEFAULT_COLLECTOR_HOST.to_string(),
            enabled: true,
            synchronous: false,
            secure: true,
            verify_cert: true,
            frequency: DEFAULT_FREQUENCY,
            max_buffer: DEFAULT_MAX_BUFFER,
            max_aggregator_size: DEFAULT_MAX_AGGREGATOR_SIZE,
            resolve_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(20),
            reply_timeout: Duration::from_secs(10),
            exit_flush_timeout: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(15),
            resolution_failures_before_waiting: 3,
            resolution_wait: Duration::from_secs(30),
        }
    }
}

/// Where the sender connects, after parsing [`AgentConfig::collector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorAddress {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl AgentConfig {
    /// Create configuration from `INSTRUMENTAL_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let api_key = env::var("INSTRUMENTAL_TOKEN").unwrap_or_default();
        let collector = env::var("INSTRUMENTAL_COLLECTOR").unwrap_or(defaults.collector);
        let enabled = env_flag("INSTRUMENTAL_ENABLED").unwrap_or(defaults.enabled);
        let secure = env_flag("INSTRUMENTAL_SECURE").unwrap_or(defaults.secure);
        let verify_cert = env_flag("INSTRUMENTAL_VERIFY_CERT").unwrap_or(defaults.verify_cert);
        let frequency = env::var("INSTRUMENTAL_FREQUENCY")
            .ok()
            .and_then(|val| val.trim().parse::<u32>().ok())
            .unwrap_or(defaults.frequency);
        let max_buffer = env::var("INSTRUMENTAL_MAX_BUFFER")
            .ok()
            .and_then(|val| val.trim().parse::<usize>().ok())
            .unwrap_or(defaults.max_buffer);

        let config = Self {
            api_key,
            collector,
            enabled,
            secure,
            verify_cert,
            frequency,
            max_buffer,
            ..Self::default()
        }
        .normalized();

        config.validate()?;
        Ok(config)
    }

    /// Snap the frequency and resolve the synchronous/aggregation conflict.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let snapped = snap_frequency(self.frequency);
        if snapped != self.frequency {
            warn!(
                "Frequency {} is not supported, using {} instead",
                self.frequency, snapped
            );
            self.frequency = snapped;
        }
        if self.synchronous && self.frequency > 0 {
            warn!("Synchronous mode disables aggregation, ignoring frequency {}", self.frequency);
            self.frequency = 0;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.api_key.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        if self.max_buffer == 0 {
            return Err(ConfigError::InvalidBuffer);
        }
        self.collector_address()?;
        Ok(())
    }

    /// Splits `collector` into host, port and transport security.
    ///
    /// A URL scheme overrides [`AgentConfig::secure`]; without an explicit port
    /// the default port of the chosen transport is used.
    pub fn collector_address(&self) -> Result<CollectorAddress, ConfigError> {
        let raw = self.collector.trim();
        let (secure, rest) = match raw.split_once("://") {
            Some(("tcp", rest)) => (false, rest),
            Some(("ssl" | "tls", rest)) => (true, rest),
            Some((scheme, _)) => {
                return Err(ConfigError::InvalidCollector(format!(
                    "unsupported scheme '{scheme}' in '{raw}'"
                )))
            }
            None => (self.secure, raw),
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None if secure => (rest, DEFAULT_SECURE_PORT),
            None => (rest, DEFAULT_PLAIN_PORT),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidCollector(raw.to_string()));
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }

        Ok(CollectorAddress {
            host: host.to_string(),
            port,
            secure,
        })
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|val| !matches!(val.trim().to_lowercase().as_str(), "false" | "0" | "no" | "off"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_token() -> AgentConfig {
        AgentConfig {
            api_key: "test_token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_with_token_is_valid() {
        assert!(with_token().validate().is_ok());
    }

    #[test]
    fn test_empty_token_only_matters_when_enabled() {
        assert!(AgentConfig::default().validate().is_err());
        let disabled = AgentConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_buffer() {
        let config = AgentConfig {
            max_buffer: 0,
            ..with_token()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBuffer)));
    }

    #[test]
    fn test_collector_defaults_port_by_security() {
        let secure = with_token().collector_address().expect("address");
        assert_eq!(
            secure,
            CollectorAddress {
                host: DEFAULT_COLLECTOR_HOST.to_string(),
                port: DEFAULT_SECURE_PORT,
                secure: true,
            }
        );

        let plain = AgentConfig {
            secure: false,
            ..with_token()
        }
        .collector_address()
        .expect("address");
        assert_eq!(plain.port, DEFAULT_PLAIN_PORT);
        assert!(!plain.secure);
    }

    #[test]
    fn test_collector_host_and_port() {
        let config = AgentConfig {
            collector: "localhost:10001".to_string(),
            secure: false,
            ..with_token()
        };
        let address = config.collector_address().expect("address");
        assert_eq!(address.host, "localhost");
        assert_eq!(address.port, 10001);
        assert!(!address.secure);
    }

    #[test]
    fn test_collector_url_scheme_overrides_secure() {
        let config = AgentConfig {
            collector: "tcp://collector.example.com:9000/".to_string(),
            secure: true,
            ..with_token()
        };
        let address = config.collector_address().expect("address");
        assert_eq!(address.host, "collector.example.com");
        assert_eq!(address.port, 9000);
        assert!(!address.secure);

        let config = AgentConfig {
            collector: "ssl://collector.example.com".to_string(),
            secure: false,
            ..with_token()
        };
        let address = config.collector_address().expect("address");
        assert_eq!(address.port, DEFAULT_SECURE_PORT);
        assert!(address.secure);
    }

    #[test]
    fn test_collector_rejects_garbage() {
        for collector in ["", "http://host:1", "host:notaport", "host:0", "two words:80"] {
            let config = AgentConfig {
                collector: collector.to_string(),
                ..with_token()
            };
            assert!(
                config.collector_address().is_err(),
                "collector '{collector}' should be rejected"
            );
        }
    }

    #[test]
    fn test_normalized_snaps_frequency() {
        let config = AgentConfig {
            frequency: 45,
            ..with_token()
        }
        .normalized();
        assert_eq!(config.frequency, 30);
    }

    #[test]
    fn test_synchronous_disables_aggregation() {
        let config = AgentConfig {
            synchronous: true,
            frequency: 10,
            ..with_token()
        }
        .normalized();
        assert!(config.synchronous);
        assert_eq!(config.frequency, 0);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"api_key": "abc", "collector": "localhost:8000", "frequency": 10}"#,
        )
        .expect("valid json");
        assert_eq!(config.api_key, "abc");
        assert_eq!(config.frequency, 10);
        assert_eq!(config.max_buffer, DEFAULT_MAX_BUFFER);
        assert_eq!(config.reply_timeout, Duration::from_secs(10));
    }
}
