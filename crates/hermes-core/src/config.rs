use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::failed_queue::QueueConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::rotation::{ProxyPool, RotationStrategy, UserAgentRotator};

/// Named starting points for [`MiddlewareConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Conservative,
    Balanced,
    Aggressive,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Conservative => "conservative",
            Preset::Balanced => "balanced",
            Preset::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(Preset::Conservative),
            "balanced" => Ok(Preset::Balanced),
            "aggressive" => Ok(Preset::Aggressive),
            _ => Err(format!("Unknown preset: {}", s)),
        }
    }
}

/// Every tunable of the middleware and the failed-task queue.
///
/// Durations are in seconds. Missing fields take their defaults when
/// deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub max_requests_per_second: f64,
    pub max_concurrent: usize,
    pub burst_size: u32,
    /// Longest wait for a slot and token; unbounded when absent.
    pub acquire_timeout: Option<f64>,

    pub max_retries: u32,
    pub base_delay: f64,
    pub max_delay: f64,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub retryable_status_codes: BTreeSet<u16>,

    pub failure_threshold: u32,
    pub recovery_timeout: f64,
    pub success_threshold: u32,
    pub half_open_max_probes: u32,

    pub user_agent_rotation: bool,
    /// Rotated user agents; the built-in browser list when empty.
    pub user_agents: Vec<String>,
    pub user_agent_strategy: RotationStrategy,

    pub proxy_enabled: bool,
    pub proxies: Vec<String>,
    pub proxy_strategy: RotationStrategy,
    pub proxy_failure_threshold: u32,
    pub proxy_recheck_interval: f64,

    pub queue_max_workers: usize,
    pub queue_poll_interval: f64,
    pub queue_base_delay: f64,
    pub queue_max_delay: f64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 4.0,
            max_concurrent: 5,
            burst_size: 10,
            acquire_timeout: None,
            max_retries: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            backoff_factor: 2.0,
            jitter: true,
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
            failure_threshold: 5,
            recovery_timeout: 60.0,
            success_threshold: 2,
            half_open_max_probes: 1,
            user_agent_rotation: true,
            user_agents: Vec::new(),
            user_agent_strategy: RotationStrategy::RoundRobin,
            proxy_enabled: false,
            proxies: Vec::new(),
            proxy_strategy: RotationStrategy::RoundRobin,
            proxy_failure_threshold: 3,
            proxy_recheck_interval: 300.0,
            queue_max_workers: 5,
            queue_poll_interval: 30.0,
            queue_base_delay: 300.0,
            queue_max_delay: 3600.0,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Overlay of `HERMES_*` variables read through a lookup function.
struct Overlay<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overlay<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str, target: &mut T) -> Result<(), AppError> {
        if let Some(raw) = self.raw(name) {
            *target = raw
                .trim()
                .parse()
                .map_err(|_| AppError::ConfigError(format!("Invalid {name} '{raw}'")))?;
        }
        Ok(())
    }

    fn flag(&self, name: &str, target: &mut bool) -> Result<(), AppError> {
        if let Some(raw) = self.raw(name) {
            *target = parse_bool(&raw).ok_or_else(|| {
                AppError::ConfigError(format!("Invalid {name} '{raw}': expected true or false"))
            })?;
        }
        Ok(())
    }
}

impl MiddlewareConfig {
    pub fn preset(preset: Preset) -> Self {
        let balanced = Self::default();
        match preset {
            Preset::Balanced => balanced,
            Preset::Conservative => Self {
                max_requests_per_second: 2.0,
                max_concurrent: 3,
                max_retries: 5,
                base_delay: 2.0,
                failure_threshold: 3,
                recovery_timeout: 120.0,
                ..balanced
            },
            Preset::Aggressive => Self {
                max_requests_per_second: 8.0,
                max_concurrent: 10,
                max_retries: 2,
                base_delay: 0.5,
                failure_threshold: 8,
                recovery_timeout: 30.0,
                ..balanced
            },
        }
    }

    /// Read configuration from environment variables.
    ///
    /// `HERMES_PRESET` picks the starting point (balanced when unset); every
    /// other `HERMES_*` variable overrides one field.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let env = Overlay { lookup };

        let mut config = match env.raw("HERMES_PRESET") {
            Some(raw) => Self::preset(raw.parse().map_err(AppError::ConfigError)?),
            None => Self::default(),
        };

        env.parse("HERMES_MAX_REQUESTS_PER_SECOND", &mut config.max_requests_per_second)?;
        env.parse("HERMES_MAX_CONCURRENT", &mut config.max_concurrent)?;
        env.parse("HERMES_BURST_SIZE", &mut config.burst_size)?;
        if let Some(raw) = env.raw("HERMES_ACQUIRE_TIMEOUT") {
            let timeout = raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid HERMES_ACQUIRE_TIMEOUT '{raw}'"))
            })?;
            config.acquire_timeout = Some(timeout);
        }

        env.parse("HERMES_MAX_RETRIES", &mut config.max_retries)?;
        env.parse("HERMES_BASE_DELAY", &mut config.base_delay)?;
        env.parse("HERMES_MAX_DELAY", &mut config.max_delay)?;
        env.parse("HERMES_BACKOFF_FACTOR", &mut config.backoff_factor)?;
        env.flag("HERMES_JITTER", &mut config.jitter)?;
        if let Some(raw) = env.raw("HERMES_RETRYABLE_STATUS_CODES") {
            config.retryable_status_codes = split_list(&raw, ',')
                .iter()
                .map(|code| code.parse::<u16>())
                .collect::<Result<_, _>>()
                .map_err(|_| {
                    AppError::ConfigError(format!("Invalid HERMES_RETRYABLE_STATUS_CODES '{raw}'"))
                })?;
        }

        env.parse("HERMES_FAILURE_THRESHOLD", &mut config.failure_threshold)?;
        env.parse("HERMES_RECOVERY_TIMEOUT", &mut config.recovery_timeout)?;
        env.parse("HERMES_SUCCESS_THRESHOLD", &mut config.success_threshold)?;
        env.parse("HERMES_HALF_OPEN_MAX_PROBES", &mut config.half_open_max_probes)?;

        env.flag("HERMES_USER_AGENT_ROTATION", &mut config.user_agent_rotation)?;
        // user agents contain commas
        if let Some(raw) = env.raw("HERMES_USER_AGENTS") {
            config.user_agents = split_list(&raw, '|');
        }
        env.parse("HERMES_USER_AGENT_STRATEGY", &mut config.user_agent_strategy)?;

        env.flag("HERMES_PROXY_ENABLED", &mut config.proxy_enabled)?;
        if let Some(raw) = env.raw("HERMES_PROXIES") {
            config.proxies = split_list(&raw, ',');
        }
        env.parse("HERMES_PROXY_STRATEGY", &mut config.proxy_strategy)?;
        env.parse("HERMES_PROXY_FAILURE_THRESHOLD", &mut config.proxy_failure_threshold)?;
        env.parse("HERMES_PROXY_RECHECK_INTERVAL", &mut config.proxy_recheck_interval)?;

        env.parse("HERMES_QUEUE_MAX_WORKERS", &mut config.queue_max_workers)?;
        env.parse("HERMES_QUEUE_POLL_INTERVAL", &mut config.queue_poll_interval)?;
        env.parse("HERMES_QUEUE_BASE_DELAY", &mut config.queue_base_delay)?;
        env.parse("HERMES_QUEUE_MAX_DELAY", &mut config.queue_max_delay)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), AppError> {
        fn positive(name: &str, value: f64) -> Result<(), AppError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(AppError::ConfigError(format!("{name} must be positive, got {value}")))
            }
        }
        fn at_least_one(name: &str, value: u64) -> Result<(), AppError> {
            if value >= 1 {
                Ok(())
            } else {
                Err(AppError::ConfigError(format!("{name} must be at least 1")))
            }
        }

        positive("max_requests_per_second", self.max_requests_per_second)?;
        at_least_one("max_concurrent", self.max_concurrent as u64)?;
        if let Some(timeout) = self.acquire_timeout {
            positive("acquire_timeout", timeout)?;
        }

        positive("base_delay", self.base_delay)?;
        positive("max_delay", self.max_delay)?;
        if self.max_delay < self.base_delay {
            return Err(AppError::ConfigError(format!(
                "max_delay ({}) must not be below base_delay ({})",
                self.max_delay, self.base_delay
            )));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(AppError::ConfigError(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        if let Some(code) = self
            .retryable_status_codes
            .iter()
            .find(|c| !(100..=599).contains(*c))
        {
            return Err(AppError::ConfigError(format!(
                "retryable_status_codes contains invalid status {code}"
            )));
        }

        at_least_one("failure_threshold", self.failure_threshold.into())?;
        at_least_one("success_threshold", self.success_threshold.into())?;
        at_least_one("half_open_max_probes", self.half_open_max_probes.into())?;
        positive("recovery_timeout", self.recovery_timeout)?;

        if self.proxy_enabled && self.proxies.is_empty() {
            return Err(AppError::ConfigError(
                "proxy_enabled is set but no proxies are configured".into(),
            ));
        }
        at_least_one("proxy_failure_threshold", self.proxy_failure_threshold.into())?;
        positive("proxy_recheck_interval", self.proxy_recheck_interval)?;

        at_least_one("queue_max_workers", self.queue_max_workers as u64)?;
        positive("queue_poll_interval", self.queue_poll_interval)?;
        positive("queue_base_delay", self.queue_base_delay)?;
        positive("queue_max_delay", self.queue_max_delay)?;
        Ok(())
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.max_requests_per_second)
            .with_max_concurrent(self.max_concurrent)
            .with_burst(self.burst_size)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout.map(secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff {
                base_delay: secs(self.base_delay),
                max_delay: secs(self.max_delay),
                factor: self.backoff_factor,
                jitter: self.jitter,
            },
            retryable_status_codes: self.retryable_status_codes.clone(),
            ..RetryPolicy::default()
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: secs(self.recovery_timeout),
            half_open_max_probes: self.half_open_max_probes,
            ..CircuitBreakerConfig::default()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_max_workers(self.queue_max_workers)
            .with_poll_interval(secs(self.queue_poll_interval))
            .with_backoff(Backoff {
                base_delay: secs(self.queue_base_delay),
                max_delay: secs(self.queue_max_delay),
                factor: 2.0,
                jitter: false,
            })
    }

    /// The user-agent rotator, unless rotation is switched off.
    pub fn user_agent_rotator(&self) -> Option<UserAgentRotator> {
        if !self.user_agent_rotation {
            return None;
        }
        Some(if self.user_agents.is_empty() {
            UserAgentRotator::with_defaults(self.user_agent_strategy)
        } else {
            UserAgentRotator::new(self.user_agents.clone(), self.user_agent_strategy)
        })
    }

    /// The proxy pool, when proxies are enabled.
    pub fn proxy_pool(&self) -> Option<ProxyPool> {
        (self.proxy_enabled && !self.proxies.is_empty()).then(|| {
            ProxyPool::new(
                self.proxies.clone(),
                self.proxy_strategy,
                self.proxy_failure_threshold,
                secs(self.proxy_recheck_interval),
            )
        })
    }
}
