//! Runtime settings read from `PERCH_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::task::ExecutionSchedule;
use crate::throttle::ThrottleConfig;

/// Runtime settings, built once at startup and passed down explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Records requested per collection cycle.
    pub max_records: usize,
    /// Records written per output file before rotating.
    pub records_per_file: usize,
    /// Keywords drawn per collection tick.
    pub sample_size: usize,
    pub keywords_file: PathBuf,
    pub output_dir: PathBuf,
    pub language: String,
    pub search_breaker: CircuitBreakerConfig,
    pub lookup_breaker: CircuitBreakerConfig,
    pub task_period: Duration,
    pub watchdog_period: Duration,
    pub supervision_budget: Duration,
    /// Attempts per author profile lookup.
    pub lookup_attempts: u32,
    /// Upper bound on pages fetched per cycle.
    pub max_pages: u32,
    /// Spacing between consecutive provider calls of the same kind.
    pub throttle: ThrottleConfig,
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 3,
            retry_cooldown: Duration::from_secs(900),
        };
        Self {
            max_records: 300,
            records_per_file: 40,
            sample_size: 3,
            keywords_file: PathBuf::from("config/keywords.cfg"),
            output_dir: PathBuf::from("output"),
            language: "en".to_string(),
            search_breaker: breaker.clone(),
            lookup_breaker: breaker,
            task_period: Duration::from_millis(3000),
            watchdog_period: Duration::from_millis(500),
            supervision_budget: Duration::from_secs(720),
            lookup_attempts: 3,
            max_pages: 15,
            throttle: ThrottleConfig::default(),
            api_base_url: None,
            api_token: None,
        }
    }
}

impl Settings {
    /// Read settings from `PERCH_*` environment variables.
    ///
    /// Unset keys keep their defaults; malformed or zero numeric values are
    /// rejected with a [`AppError::ConfigError`] naming the key.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Settings::from_env`], reading keys through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            max_records: positive(&lookup, "PERCH_MAX_RECORDS", defaults.max_records)?,
            records_per_file: positive(&lookup, "PERCH_RECORDS_PER_FILE", defaults.records_per_file)?,
            sample_size: positive(&lookup, "PERCH_SAMPLE_SIZE", defaults.sample_size)?,
            keywords_file: text("PERCH_KEYWORDS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.keywords_file),
            output_dir: text("PERCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            language: text("PERCH_LANGUAGE").unwrap_or(defaults.language),
            search_breaker: CircuitBreakerConfig {
                failure_threshold: positive(
                    &lookup,
                    "PERCH_SEARCH_FAILURE_THRESHOLD",
                    defaults.search_breaker.failure_threshold,
                )?,
                retry_cooldown: Duration::from_secs(positive(
                    &lookup,
                    "PERCH_SEARCH_COOLDOWN_SECS",
                    defaults.search_breaker.retry_cooldown.as_secs(),
                )?),
            },
            lookup_breaker: CircuitBreakerConfig {
                failure_threshold: positive(
                    &lookup,
                    "PERCH_LOOKUP_FAILURE_THRESHOLD",
                    defaults.lookup_breaker.failure_threshold,
                )?,
                retry_cooldown: Duration::from_secs(positive(
                    &lookup,
                    "PERCH_LOOKUP_COOLDOWN_SECS",
                    defaults.lookup_breaker.retry_cooldown.as_secs(),
                )?),
            },
            task_period: Duration::from_millis(positive(
                &lookup,
                "PERCH_TASK_PERIOD_MS",
                defaults.task_period.as_millis() as u64,
            )?),
            watchdog_period: Duration::from_millis(positive(
                &lookup,
                "PERCH_WATCHDOG_PERIOD_MS",
                defaults.watchdog_period.as_millis() as u64,
            )?),
            supervision_budget: Duration::from_secs(positive(
                &lookup,
                "PERCH_SUPERVISION_BUDGET_SECS",
                defaults.supervision_budget.as_secs(),
            )?),
            lookup_attempts: positive(&lookup, "PERCH_LOOKUP_ATTEMPTS", defaults.lookup_attempts)?,
            max_pages: positive(&lookup, "PERCH_MAX_PAGES", defaults.max_pages)?,
            throttle: ThrottleConfig::new(Duration::from_millis(number(
                &lookup,
                "PERCH_THROTTLE_DELAY_MS",
                defaults.throttle.delay.as_millis() as u64,
            )?))
            .with_jitter(Duration::from_millis(number(
                &lookup,
                "PERCH_THROTTLE_JITTER_MS",
                defaults.throttle.jitter.as_millis() as u64,
            )?)),
            api_base_url: text("PERCH_API_BASE_URL"),
            api_token: text("PERCH_API_TOKEN"),
        })
    }

    /// Schedule of the collection task.
    pub fn task_schedule(&self) -> Result<ExecutionSchedule, AppError> {
        ExecutionSchedule::new(Duration::ZERO, self.task_period)
    }

    /// Polling schedule of the watchdog.
    pub fn watchdog_schedule(&self) -> Result<ExecutionSchedule, AppError> {
        ExecutionSchedule::new(Duration::ZERO, self.watchdog_period)
    }
}

fn positive<F, N>(lookup: &F, key: &str, default: N) -> Result<N, AppError>
where
    F: Fn(&str) -> Option<String>,
    N: FromStr + PartialEq + Default,
{
    let parsed = number(lookup, key, default)?;
    if parsed == N::default() {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(parsed)
}

/// Unsigned integer under `key`; zero allowed.
fn number<F, N>(lookup: &F, key: &str, default: N) -> Result<N, AppError>
where
    F: Fn(&str) -> Option<String>,
    N: FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let raw = raw.trim();
    raw.parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
    })
}
