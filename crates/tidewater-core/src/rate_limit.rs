//! Pluggable throttles for source reads and target writes.
//!
//! A dumper calls [`RateLimiter::intercept`] once per batch before it
//! issues the read. The call only affects timing: it sleeps until the
//! configured rate allows the operation and never touches positions or
//! records. Limiters are shared read-only across the job items of a job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::Properties;
use crate::error::ConfigError;

/// Kind of operation being throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    /// Source read.
    Select,
    /// Target insert.
    Insert,
    /// Target update.
    Update,
    /// Target delete.
    Delete,
}

/// Throttle invoked before each batch.
#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Waits until `units` operations of `kind` may proceed.
    async fn intercept(&self, kind: OperationKind, units: u32);
}

/// Token bucket that runs into debt instead of rejecting.
///
/// Tokens refill at a constant rate up to `max_tokens`. A reservation
/// larger than the balance succeeds immediately but returns how long the
/// caller must wait for the balance to become non-negative again, so
/// oversized requests still make progress.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens per second, also the bucket size. 0 = unlimited.
    max_tokens: u32,
    /// Current balance; negative while in debt.
    tokens: f64,
    /// Last refill timestamp.
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket refilling at `max_per_second`.
    #[must_use]
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_tokens: max_per_second,
            tokens: f64::from(max_per_second),
            last_refill: Instant::now(),
        }
    }

    /// Reserves `units` tokens and returns how long to wait before using them.
    pub fn reserve(&mut self, units: u32) -> Duration {
        if self.max_tokens == 0 {
            return Duration::ZERO;
        }
        self.refill();
        self.tokens -= f64::from(units);
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / f64::from(self.max_tokens))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * f64::from(self.max_tokens)).min(f64::from(self.max_tokens));
        self.last_refill = now;
    }
}

async fn acquire(bucket: &Mutex<TokenBucket>, units: u32) {
    let wait = bucket.lock().reserve(units);
    if !wait.is_zero() {
        tracing::trace!(wait = ?wait, units, "Rate limited");
        tokio::time::sleep(wait).await;
    }
}

/// Limits source reads (`Select`) per second. Writes pass through.
#[derive(Debug)]
pub struct QpsRateLimiter {
    qps: u32,
    bucket: Mutex<TokenBucket>,
}

impl QpsRateLimiter {
    /// Default reads per second.
    pub const DEFAULT_QPS: u32 = 30;

    /// Creates a limiter allowing `qps` reads per second.
    #[must_use]
    pub fn new(qps: u32) -> Self {
        Self {
            qps,
            bucket: Mutex::new(TokenBucket::new(qps)),
        }
    }

    /// Configured rate.
    #[must_use]
    pub fn qps(&self) -> u32 {
        self.qps
    }
}

#[async_trait]
impl RateLimiter for QpsRateLimiter {
    async fn intercept(&self, kind: OperationKind, units: u32) {
        if kind == OperationKind::Select {
            acquire(&self.bucket, units).await;
        }
    }
}

/// Limits target writes per second. Reads pass through.
#[derive(Debug)]
pub struct TpsRateLimiter {
    tps: u32,
    bucket: Mutex<TokenBucket>,
}

impl TpsRateLimiter {
    /// Default writes per second.
    pub const DEFAULT_TPS: u32 = 2000;

    /// Creates a limiter allowing `tps` writes per second.
    #[must_use]
    pub fn new(tps: u32) -> Self {
        Self {
            tps,
            bucket: Mutex::new(TokenBucket::new(tps)),
        }
    }

    /// Configured rate.
    #[must_use]
    pub fn tps(&self) -> u32 {
        self.tps
    }
}

#[async_trait]
impl RateLimiter for TpsRateLimiter {
    async fn intercept(&self, kind: OperationKind, units: u32) {
        if kind != OperationKind::Select {
            acquire(&self.bucket, units).await;
        }
    }
}

/// Rate limiter selection: algorithm type plus its properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// `QPS` or `TPS` (case-insensitive).
    #[serde(rename = "type")]
    pub kind: String,
    /// Algorithm properties (`qps` / `tps`).
    #[serde(default)]
    pub props: Properties,
}

impl RateLimiterConfig {
    /// Builds the configured limiter.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Unsupported` for an unknown type and
    /// `ConfigError::Invalid` for a malformed rate.
    pub fn build(&self) -> Result<Arc<dyn RateLimiter>, ConfigError> {
        match self.kind.to_ascii_uppercase().as_str() {
            "QPS" => {
                let qps = self
                    .props
                    .get_parsed("qps")?
                    .unwrap_or(QpsRateLimiter::DEFAULT_QPS);
                Ok(Arc::new(QpsRateLimiter::new(qps)))
            }
            "TPS" => {
                let tps = self
                    .props
                    .get_parsed("tps")?
                    .unwrap_or(TpsRateLimiter::DEFAULT_TPS);
                Ok(Arc::new(TpsRateLimiter::new(tps)))
            }
            _ => Err(ConfigError::Unsupported {
                kind: "rate limiter",
                name: self.kind.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_bucket_never_waits() {
        let mut bucket = TokenBucket::new(0);
        for _ in 0..1000 {
            assert_eq!(bucket.reserve(1), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_goes_into_debt() {
        let mut bucket = TokenBucket::new(10);
        for _ in 0..10 {
            assert_eq!(bucket.reserve(1), Duration::ZERO);
        }
        let wait = bucket.reserve(5);
        assert_eq!(wait, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_qps_limits_selects_only() {
        let limiter = QpsRateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.intercept(OperationKind::Select, 1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));

        limiter.intercept(OperationKind::Insert, 1000).await;
        assert!(start.elapsed() < Duration::from_millis(1));

        limiter.intercept(OperationKind::Select, 1).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tps_limits_writes_only() {
        let limiter = TpsRateLimiter::new(100);
        let start = Instant::now();
        limiter.intercept(OperationKind::Select, 10_000).await;
        assert!(start.elapsed() < Duration::from_millis(1));
        limiter.intercept(OperationKind::Insert, 150).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn test_build_from_config() {
        let config = RateLimiterConfig {
            kind: "qps".into(),
            props: Properties::from_pairs([("qps", "50")]),
        };
        assert!(config.build().is_ok());

        let bad = RateLimiterConfig {
            kind: "QPS".into(),
            props: Properties::from_pairs([("qps", "fast")]),
        };
        assert!(matches!(bad.build(), Err(ConfigError::Invalid { .. })));

        let unknown = RateLimiterConfig {
            kind: "leaky".into(),
            props: Properties::default(),
        };
        assert!(matches!(unknown.build(), Err(ConfigError::Unsupported { .. })));
    }
}
