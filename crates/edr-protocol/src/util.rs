// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for reading configuration values from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Reads and parses an environment variable.
///
/// Unset variables yield `None`. Values that fail to parse are logged and ignored so that the
/// caller's default applies.
pub fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::error!("Ignoring invalid value '{}' for {}", value, name);
            None
        }
    }
}

/// Reads a duration expressed in milliseconds.
pub fn env_duration_ms(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

/// Reads a boolean flag; anything but `false` or `0` (case insensitive) is true.
pub fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|val| !matches!(val.trim().to_lowercase().as_str(), "false" | "0"))
}

/// Reads a non-empty string, trimming surrounding whitespace.
pub fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
}
