// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Link backoff, apply throttling and the per-peer resolver bulkhead.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), replication_mesh::resilience::BulkheadClosed> {
//! use replication_mesh::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let bulkhead = Bulkhead::new(4);
//! let _slot = bulkhead.acquire().await?;
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Exponential backoff between failed link cycles.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed cycles tolerated before the link gives up. `usize::MAX` never does.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth per attempt. Values below 1.0 (or NaN) keep the delay flat.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Never give up; 1s doubling to a 300s ceiling (reached at attempt 10).
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Sleep before retry number `attempt` (1-based; 0 behaves like 1).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 || !(self.backoff_factor >= 1.0) {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = (attempt - 1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

// =============================================================================
// Apply throttling
// =============================================================================

/// `refill_rate` applies per second, with up to `burst_size` banked.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Throttles the applies of one link, so a link catching up after a long
/// outage does not monopolise its local peer.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: GovLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
        }
    }

    /// Wait until the next apply is allowed.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

// =============================================================================
// Resolver bulkhead
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed ({capacity} slots)")]
pub struct BulkheadClosed {
    pub capacity: usize,
}

/// Caps concurrent resolver invocations on one peer. Resolution tasks wait
/// here; applies never do.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl Bulkhead {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot, held until the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed { capacity: self.capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
