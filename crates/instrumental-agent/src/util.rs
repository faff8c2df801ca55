// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation and host identification helpers.

use lazy_static::lazy_static;
use regex::Regex;
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

lazy_static! {
    static ref METRIC_NAME_REGEX: Regex =
        Regex::new(r"^([A-Za-z0-9_\-]+\.)*[A-Za-z0-9_\-]+$").expect("failed creating regex");
}

/// Magnitudes from here on only have an exponent form.
const MAX_METRIC_VALUE: f64 = 1e16;

/// Dot separated segments of ASCII letters, digits, underscores and dashes.
///
/// ```
/// use instrumental_agent::util::valid_metric_name;
///
/// assert!(valid_metric_name("hello.world"));
/// assert!(!valid_metric_name(" %% .!#@$%^&*"));
/// ```
#[must_use]
pub fn valid_metric_name(metric: &str) -> bool {
    METRIC_NAME_REGEX.is_match(metric)
}

/// Finite values with a magnitude below `1e16`.
///
/// ```
/// use instrumental_agent::util::valid_metric_value;
///
/// assert!(valid_metric_value(1e15));
/// assert!(!valid_metric_value(1e16));
/// assert!(!valid_metric_value(f64::NAN));
/// ```
#[must_use]
pub fn valid_metric_value(value: f64) -> bool {
    value.is_finite() && value.abs() < MAX_METRIC_VALUE
}

/// Current unix time in whole seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Hostname announced in the `hello` line.
///
/// `INSTRUMENTAL_HOSTNAME` wins, then the `gethostname` syscall, then "unknown".
#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("INSTRUMENTAL_HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str() {
                if !hostname.is_empty() {
                    return hostname.to_string();
                }
            }
        }
        Err(e) => warn!("Failed to get system hostname: {}", e),
    }

    "unknown".to_string()
}

#[must_use]
pub fn platform() -> String {
    format!("{}-{}", env::consts::ARCH, env::consts::OS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasonable_metric_names() {
        for name in [
            "a",
            "a.b",
            "hello.world",
            "ThisIsATest.Of.The.Emergency.Broadcast.System.12345",
            "with-dash.and_underscore",
        ] {
            assert!(valid_metric_name(name), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_metric_names() {
        for name in [
            "",
            " %% .!#@$%^&*",
            "a..b",
            ".a",
            "a.",
            "a b",
            "a\nb",
            "café.latency",
            "метрика",
            "a.\u{663}",
        ] {
            assert!(!valid_metric_name(name), "{name:?} should be invalid");
        }
    }

    #[test]
    fn test_reasonable_values() {
        for value in [
            -333.333,
            -2.2,
            -1.0,
            0.0,
            1.0,
            2.2,
            333.333,
            0.000_001,
            1e-12,
            9_999_999_999_999_998.0,
            -1e15,
        ] {
            assert!(valid_metric_value(value), "{value} should be valid");
        }
    }

    #[test]
    fn test_invalid_values() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e16, -1e16, 1e21] {
            assert!(!valid_metric_value(value), "{value} should be invalid");
        }
    }

    #[test]
    fn test_get_hostname_not_empty() {
        assert!(!get_hostname().is_empty());
    }

    #[test]
    fn test_platform_has_arch_and_os() {
        let platform = platform();
        assert!(platform.contains(env::consts::OS));
        assert!(platform.contains(env::consts::ARCH));
    }
}
