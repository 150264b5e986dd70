//! Process configuration, read once from `KUBEDECK_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub log_dir: PathBuf,
    /// Overrides the kubeconfig `current-context` at startup.
    pub initial_context: Option<String>,
    pub watch: WatchConfig,
    pub session: SessionConfig,
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// How long a key may sit with zero subscribers before it is closed.
    pub idle_grace: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub subscriber_buffer: usize,
    pub sample_limit: usize,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub start_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            subscriber_buffer: 64,
            sample_limit: 100,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            log_dir: PathBuf::from("logs"),
            initial_context: None,
            watch: WatchConfig::default(),
            session: SessionConfig::default(),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: env::var("KUBEDECK_BIND_ADDR").unwrap_or(defaults.bind_addr),
            log_dir: env::var("KUBEDECK_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            initial_context: env::var("KUBEDECK_CONTEXT")
                .ok()
                .filter(|c| !c.trim().is_empty()),
            watch: WatchConfig {
                idle_grace: Duration::from_secs(parse_env(
                    "KUBEDECK_WATCH_IDLE_GRACE_SECS",
                    defaults.watch.idle_grace.as_secs(),
                )),
                backoff_initial: Duration::from_millis(parse_env(
                    "KUBEDECK_WATCH_BACKOFF_INITIAL_MS",
                    defaults.watch.backoff_initial.as_millis() as u64,
                )),
                backoff_max: Duration::from_millis(parse_env(
                    "KUBEDECK_WATCH_BACKOFF_MAX_MS",
                    defaults.watch.backoff_max.as_millis() as u64,
                )),
                subscriber_buffer: parse_env(
                    "KUBEDECK_SUBSCRIBER_BUFFER",
                    defaults.watch.subscriber_buffer,
                )
                .max(1),
                sample_limit: parse_env(
                    "KUBEDECK_SUMMARY_SAMPLE_LIMIT",
                    defaults.watch.sample_limit,
                ),
            },
            session: SessionConfig {
                start_timeout: Duration::from_secs(parse_env(
                    "KUBEDECK_SESSION_START_TIMEOUT_SECS",
                    defaults.session.start_timeout.as_secs(),
                )),
            },
            probe_timeout: Duration::from_secs(parse_env(
                "KUBEDECK_PROBE_TIMEOUT_SECS",
                defaults.probe_timeout.as_secs(),
            )),
        }
    }
}

fn parse_env<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => parse_or_default(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or_default<T: FromStr + Copy + std::fmt::Display>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!("Invalid value '{}' for {}, using default {}", raw, key, default);
            default
        }
    }
}
