// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tracing::warn;

const DEFAULT_LOG_FILTER: &str = "info";
const MIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind_addr: String,
    pub http_backlog: usize,
    pub http_workers: usize,
    pub http_request_timeout: Duration,
    pub bind_retry: Duration,
    pub status_recv_timeout: Duration,
    pub response_timeout: Duration,
    pub wait_for_response: bool,
    pub dry_run: bool,
    pub dump_status: bool,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind_addr: "0.0.0.0:8000".to_string(),
            http_backlog: 10_000,
            http_workers: 4,
            http_request_timeout: Duration::from_secs(600),
            bind_retry: Duration::from_secs(10),
            status_recv_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(30),
            wait_for_response: false,
            dry_run: false,
            dump_status: false,
            queue_capacity: 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparsable values fall back
    /// to the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        Self {
            http_bind_addr: lookup("MESHGATE_HTTP_BIND").unwrap_or(defaults.http_bind_addr),
            http_backlog: parse_or(&lookup, "MESHGATE_HTTP_BACKLOG", defaults.http_backlog).max(1),
            http_workers: parse_or(&lookup, "MESHGATE_HTTP_WORKERS", defaults.http_workers).max(1),
            http_request_timeout: secs_or(
                &lookup,
                "MESHGATE_HTTP_REQUEST_TIMEOUT_SECS",
                defaults.http_request_timeout,
            ),
            bind_retry: secs_or(&lookup, "MESHGATE_BIND_RETRY_SECS", defaults.bind_retry),
            status_recv_timeout: secs_or(
                &lookup,
                "MESHGATE_STATUS_RECV_TIMEOUT_SECS",
                defaults.status_recv_timeout,
            ),
            response_timeout: secs_or(
                &lookup,
                "MESHGATE_RESPONSE_TIMEOUT_SECS",
                defaults.response_timeout,
            )
            .max(MIN_RESPONSE_TIMEOUT),
            wait_for_response: flag_or(
                &lookup,
                "MESHGATE_WAIT_FOR_RESPONSE",
                defaults.wait_for_response,
            ),
            dry_run: flag_or(&lookup, "MESHGATE_DRY_RUN", defaults.dry_run),
            dump_status: flag_or(&lookup, "MESHGATE_DUMP_STATUS", defaults.dump_status),
            queue_capacity: parse_or(&lookup, "MESHGATE_QUEUE_CAPACITY", defaults.queue_capacity)
                .max(1),
        }
    }
}

/// Tracing filter directive, read before the subscriber exists.
pub fn log_filter() -> String {
    std::env::var("MESHGATE_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable config value");
                default
            }
        },
        None => default,
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parse_or(lookup, key, default.as_secs()))
}

fn flag_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            _ => {
                warn!(key, value = %raw, "ignoring unparsable config flag");
                default
            }
        },
        None => default,
    }
}
