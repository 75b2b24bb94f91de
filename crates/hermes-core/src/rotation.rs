//! User-agent and proxy rotation applied per attempt.
//!
//! A proxy that fails `failure_threshold` transport calls in a row is taken
//! out of rotation. Once `recheck_interval` has passed it is handed out for
//! one trial request; a success puts it back, another failure restarts the
//! interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Browser user agents used when none are configured.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/121.0",
];

/// How the next entry is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Always the first healthy entry. User agents treat this as round-robin.
    Failover,
}

impl std::str::FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(RotationStrategy::RoundRobin),
            "random" => Ok(RotationStrategy::Random),
            "failover" => Ok(RotationStrategy::Failover),
            _ => Err(format!("Unknown rotation strategy: {}", s)),
        }
    }
}

/// Hands out a user agent per attempt.
#[derive(Debug, Clone)]
pub struct UserAgentRotator {
    agents: Arc<Vec<String>>,
    strategy: RotationStrategy,
    cursor: Arc<AtomicUsize>,
}

impl UserAgentRotator {
    pub fn new(agents: Vec<String>, strategy: RotationStrategy) -> Self {
        Self {
            agents: Arc::new(agents),
            strategy,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_defaults(strategy: RotationStrategy) -> Self {
        Self::new(
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            strategy,
        )
    }

    pub fn pick(&self) -> Option<String> {
        if self.agents.is_empty() {
            return None;
        }
        match self.strategy {
            RotationStrategy::Random => self.agents.choose(&mut rand::thread_rng()).cloned(),
            RotationStrategy::RoundRobin | RotationStrategy::Failover => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.agents.len();
                Some(self.agents[i].clone())
            }
        }
    }
}

#[derive(Debug)]
struct ProxyEntry {
    url: String,
    consecutive_failures: u32,
    /// Set while out of rotation; reset to the trial time on each trial.
    unhealthy_since: Option<Instant>,
}

#[derive(Debug)]
struct PoolInner {
    entries: Vec<ProxyEntry>,
    cursor: usize,
}

/// Health view of one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
}

/// Health-tracked proxy rotation.
#[derive(Debug, Clone)]
pub struct ProxyPool {
    strategy: RotationStrategy,
    failure_threshold: u32,
    recheck_interval: Duration,
    inner: Arc<Mutex<PoolInner>>,
}

impl ProxyPool {
    pub fn new(
        proxies: Vec<String>,
        strategy: RotationStrategy,
        failure_threshold: u32,
        recheck_interval: Duration,
    ) -> Self {
        let entries = proxies
            .into_iter()
            .map(|url| ProxyEntry {
                url,
                consecutive_failures: 0,
                unhealthy_since: None,
            })
            .collect();
        Self {
            strategy,
            failure_threshold: failure_threshold.max(1),
            recheck_interval,
            inner: Arc::new(Mutex::new(PoolInner { entries, cursor: 0 })),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool mutex");
            poisoned.into_inner()
        })
    }

    /// Pick a proxy for the next attempt.
    ///
    /// When every proxy is out of rotation and none is due for a trial, the
    /// one that has been out longest is tried anyway.
    pub fn pick(&self) -> Option<String> {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        if inner.entries.is_empty() {
            return None;
        }

        let usable: Vec<usize> = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| self.is_usable(e, now))
            .map(|(i, _)| i)
            .collect();

        let chosen = if usable.is_empty() {
            inner
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.unhealthy_since)
                .map(|(i, _)| i)?
        } else {
            match self.strategy {
                RotationStrategy::Failover => usable[0],
                RotationStrategy::Random => usable[rand::thread_rng().gen_range(0..usable.len())],
                RotationStrategy::RoundRobin => {
                    let len = inner.entries.len();
                    let start = inner.cursor;
                    let next = (0..len)
                        .map(|offset| (start + offset) % len)
                        .find(|i| usable.contains(i))
                        .unwrap_or(usable[0]);
                    inner.cursor = (next + 1) % len;
                    next
                }
            }
        };

        let entry = &mut inner.entries[chosen];
        if entry.unhealthy_since.is_some() {
            tracing::debug!(proxy = %entry.url, "Trial request through unhealthy proxy");
            entry.unhealthy_since = Some(now);
        }
        Some(entry.url.clone())
    }

    pub fn record_success(&self, proxy: &str) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.url == proxy) {
            if entry.unhealthy_since.take().is_some() {
                tracing::info!(proxy = %entry.url, "Proxy back in rotation");
            }
            entry.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self, proxy: &str) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.url == proxy) {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= self.failure_threshold {
                if entry.unhealthy_since.is_none() {
                    tracing::warn!(
                        proxy = %entry.url,
                        failures = entry.consecutive_failures,
                        "Proxy marked unhealthy"
                    );
                }
                entry.unhealthy_since = Some(Instant::now());
            }
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.lock_inner()
            .entries
            .iter()
            .filter(|e| e.unhealthy_since.is_none())
            .count()
    }

    pub fn statuses(&self) -> Vec<ProxyStatus> {
        self.lock_inner()
            .entries
            .iter()
            .map(|e| ProxyStatus {
                url: e.url.clone(),
                healthy: e.unhealthy_since.is_none(),
                consecutive_failures: e.consecutive_failures,
            })
            .collect()
    }

    fn is_usable(&self, entry: &ProxyEntry, now: Instant) -> bool {
        match entry.unhealthy_since {
            None => true,
            Some(since) => now.saturating_duration_since(since) >= self.recheck_interval,
        }
    }
}
