//! Worker configuration, read once at startup.
//!
//! | Env Var                   | Default           |
//! |---------------------------|-------------------|
//! | `DATABASE_URL`            | required          |
//! | `DATABASE_MAX_CONNECTIONS`| `10`              |
//! | `QUEUE_NAME`              | `default`         |
//! | `QUEUE_STRATEGY`          | `auto`            |
//! | `WORKER_ID`               | `<host>-<uuid>`   |
//! | `POLL_INTERVAL_SECS`      | `5`               |
//! | `MAX_CONCURRENT_JOBS`     | `3`               |
//! | `JOB_TIMEOUT_SECS`        | `3600`            |
//! | `CLAIM_GRACE_SECS`        | `60`              |
//! | `MAX_RETRIES`             | `5`               |
//! | `RETRY_BASE_DELAY_SECS`   | `10`              |
//! | `RETRY_MAX_DELAY_SECS`    | `600`             |
//! | `RETRY_JITTER`            | `0.1`             |
//! | `NON_RETRYABLE_KINDS`     | `invalid_payload` |
//! | `NON_RETRYABLE_PATTERNS`  | empty             |
//! | `HEARTBEAT_INTERVAL_SECS` | `30`              |
//! | `RELAY_INTERVAL_SECS`     | `1`               |
//! | `REAPER_INTERVAL_SECS`    | `15`              |
//! | `ARCHIVE_AFTER_HOURS`     | unset             |
//! | `SHUTDOWN_TIMEOUT_SECS`   | `30`              |
//! | `CALCULATION_BINARY`      | `xtb-runner`      |
//! | `CALCULATION_ARGS`        | empty             |
//! | `CALCULATION_WORKDIR`     | unset             |
//! | `LOG_FORMAT`              | `text`            |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use orbital_core::error::CoreError;
use orbital_core::execution::AdapterConfig;
use orbital_core::retry::{ConfiguredClassifier, RetryPolicy};
use orbital_core::types::{DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_NAME};
use orbital_db::queue::StrategyPreference;

/// Environment variables forwarded to the calculation subprocess.
const FORWARDED_ENV_PREFIX: &str = "CALC_ENV_";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CoreError::Config {
                key: "LOG_FORMAT",
                message: format!("expected text or json, got \"{other}\""),
            }),
        }
    }
}

/// Immutable per-process configuration, shared by `Arc`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,

    pub queue_name: String,
    pub queue_strategy: StrategyPreference,

    pub worker_id: String,
    pub hostname: String,

    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    /// Added to `job_timeout` to get the claim's visibility timeout.
    pub claim_grace: Duration,

    /// Fleet-wide retry ceiling; a job's own `max_retries` can only lower it.
    pub max_retries: i32,
    pub retry_policy: RetryPolicy,
    pub classifier: ConfiguredClassifier,

    pub heartbeat_interval: Duration,
    pub relay_interval: Duration,
    pub reaper_interval: Duration,
    pub archive_after: Option<Duration>,
    pub shutdown_timeout: Duration,

    pub calculation: AdapterConfig,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        Self::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .map(|mut config| {
            config.calculation.env_vars = forwarded_env(&vars);
            config
        })
    }

    /// Build configuration from any key lookup. Unset and blank values take
    /// their default; present but invalid values are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or(CoreError::Config {
            key: "DATABASE_URL",
            message: "must be set".into(),
        })?;

        let hostname = get("HOSTNAME").unwrap_or_else(|| "localhost".into());
        let worker_id = get("WORKER_ID")
            .unwrap_or_else(|| format!("{hostname}-{}", uuid::Uuid::now_v7().simple()));

        let job_timeout = secs(&get, "JOB_TIMEOUT_SECS", 3600)?;
        let base_delay = Duration::from_secs(parse(&get, "RETRY_BASE_DELAY_SECS", 10u64)?);
        let max_delay = Duration::from_secs(parse(&get, "RETRY_MAX_DELAY_SECS", 600u64)?);
        let jitter: f64 = parse(&get, "RETRY_JITTER", 0.1)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(CoreError::Config {
                key: "RETRY_JITTER",
                message: format!("must be between 0 and 1, got {jitter}"),
            });
        }

        let max_retries: i32 = parse(&get, "MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        if max_retries < 0 {
            return Err(CoreError::Config {
                key: "MAX_RETRIES",
                message: "must not be negative".into(),
            });
        }

        let max_concurrent_jobs: usize = parse(&get, "MAX_CONCURRENT_JOBS", 3)?;
        if max_concurrent_jobs == 0 {
            return Err(CoreError::Config {
                key: "MAX_CONCURRENT_JOBS",
                message: "must be greater than 0".into(),
            });
        }

        let classifier = ConfiguredClassifier::parse(
            &get("NON_RETRYABLE_KINDS").unwrap_or_else(|| "invalid_payload".into()),
            &get("NON_RETRYABLE_PATTERNS").unwrap_or_default(),
        )?;

        let archive_after = match get("ARCHIVE_AFTER_HOURS") {
            Some(raw) => Some(Duration::from_secs(
                parse_value::<u64>("ARCHIVE_AFTER_HOURS", &raw)? * 3600,
            )),
            None => None,
        };

        let calculation = AdapterConfig {
            binary: PathBuf::from(get("CALCULATION_BINARY").unwrap_or_else(|| "xtb-runner".into())),
            args: get("CALCULATION_ARGS")
                .map(|a| a.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            env_vars: Vec::new(),
            working_directory: get("CALCULATION_WORKDIR").map(PathBuf::from),
            timeout: job_timeout,
        };

        Ok(Self {
            database_url,
            database_max_connections: parse(&get, "DATABASE_MAX_CONNECTIONS", 10u32)?,
            queue_name: get("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.into()),
            queue_strategy: match get("QUEUE_STRATEGY") {
                Some(raw) => raw.parse().map_err(|e: CoreError| CoreError::Config {
                    key: "QUEUE_STRATEGY",
                    message: e.to_string(),
                })?,
                None => StrategyPreference::Auto,
            },
            worker_id,
            hostname,
            poll_interval: secs(&get, "POLL_INTERVAL_SECS", 5)?,
            max_concurrent_jobs,
            job_timeout,
            claim_grace: Duration::from_secs(parse(&get, "CLAIM_GRACE_SECS", 60u64)?),
            max_retries,
            retry_policy: RetryPolicy {
                base_delay,
                max_delay,
                jitter,
            },
            classifier,
            heartbeat_interval: secs(&get, "HEARTBEAT_INTERVAL_SECS", 30)?,
            relay_interval: secs(&get, "RELAY_INTERVAL_SECS", 1)?,
            reaper_interval: secs(&get, "REAPER_INTERVAL_SECS", 15)?,
            archive_after,
            shutdown_timeout: Duration::from_secs(parse(&get, "SHUTDOWN_TIMEOUT_SECS", 30u64)?),
            calculation,
            log_format: match get("LOG_FORMAT") {
                Some(raw) => raw.parse()?,
                None => LogFormat::Text,
            },
        })
    }

    /// How long a claim stays valid without acknowledgment.
    pub fn visibility_timeout(&self) -> Duration {
        self.job_timeout + self.claim_grace
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| CoreError::Config {
        key,
        message: format!("\"{raw}\": {e}"),
    })
}

/// A strictly positive number of seconds.
fn secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, CoreError> {
    match parse(get, key, default)? {
        0 => Err(CoreError::Config {
            key,
            message: "must be greater than 0".into(),
        }),
        n => Ok(Duration::from_secs(n)),
    }
}

/// `CALC_ENV_FOO=bar` in the worker's environment becomes `FOO=bar` for the
/// calculation subprocess.
fn forwarded_env(vars: &[(String, String)]) -> Vec<(String, String)> {
    vars.iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(FORWARDED_ENV_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), v.clone()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
