//! Runtime configuration.
//!
//! Every setting has a default, so a bus can be built entirely in code.
//! [`ServiceBusConfig::from_env`] overrides the defaults from the environment
//! (and a `.env` file, if present):
//!
//! | Variable | Default |
//! |---|---|
//! | `SERVICE_BUS_ENTRY_POINT_NAME` | `service-bus` |
//! | `SERVICE_BUS_MAX_CONCURRENT_TASKS` | `60` |
//! | `SERVICE_BUS_AWAIT_DELAY_MS` | `20` |
//! | `SERVICE_BUS_STOP_POLL_INTERVAL_MS` | `1000` |
//! | `SERVICE_BUS_DEFAULT_EXECUTION_TIMEOUT_MS` | unset |
//! | `SERVICE_BUS_SCHEDULER_CONFLICT_RETRIES` | `3` |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::ConfigError;

/// Entry point settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointConfig {
    /// Name used in logs.
    pub name: String,
    /// Upper bound on concurrently processed packages.
    pub max_concurrent_tasks: usize,
    /// Backpressure poll interval while the bound is reached.
    pub await_delay: Duration,
    /// Drain poll interval while stopping.
    pub stop_poll_interval: Duration,
}

impl Default for EntryPointConfig {
    fn default() -> Self {
        Self {
            name: "service-bus".to_string(),
            max_concurrent_tasks: 60,
            await_delay: Duration::from_millis(20),
            stop_poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How many times a mutation is retried after a revision conflict.
    pub conflict_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 3,
        }
    }
}

/// All runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceBusConfig {
    pub entry_point: EntryPointConfig,
    pub scheduler: SchedulerConfig,
    /// Applied to handlers without an explicit execution timeout.
    pub default_execution_timeout: Option<Duration>,
}

impl ServiceBusConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EntryPointConfig::default();

        let max_concurrent_tasks = parse(&lookup, "SERVICE_BUS_MAX_CONCURRENT_TASKS", "a positive integer")?
            .unwrap_or(defaults.max_concurrent_tasks);
        if max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid {
                name: "SERVICE_BUS_MAX_CONCURRENT_TASKS",
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }

        let entry_point = EntryPointConfig {
            name: lookup("SERVICE_BUS_ENTRY_POINT_NAME").unwrap_or(defaults.name),
            max_concurrent_tasks,
            await_delay: parse(&lookup, "SERVICE_BUS_AWAIT_DELAY_MS", "milliseconds")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.await_delay),
            stop_poll_interval: parse(&lookup, "SERVICE_BUS_STOP_POLL_INTERVAL_MS", "milliseconds")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_poll_interval),
        };

        let scheduler = SchedulerConfig {
            conflict_retries: parse(&lookup, "SERVICE_BUS_SCHEDULER_CONFLICT_RETRIES", "an integer")?
                .unwrap_or(SchedulerConfig::default().conflict_retries),
        };

        let default_execution_timeout =
            parse(&lookup, "SERVICE_BUS_DEFAULT_EXECUTION_TIMEOUT_MS", "milliseconds")?
                .map(Duration::from_millis);

        Ok(Self {
            entry_point,
            scheduler,
            default_execution_timeout,
        })
    }
}

fn parse<T, F>(lookup: &F, name: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name,
                expected,
                value,
            }),
    }
}
