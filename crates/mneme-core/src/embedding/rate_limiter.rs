//! Rate limiting for embedding calls
//!
//! At most `tokens_per_interval` calls may start within any window of
//! length `interval`. Spent tokens are kept as a log of instants, so a
//! token returns exactly one interval after it was taken. Callers over
//! budget wait; nobody is rejected.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::EmbeddingConfig;

/// Snapshot of limiter state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStatus {
    pub available_tokens: u32,
    pub max_tokens: u32,
    /// Time until the oldest spent token returns; 0 when none are spent
    pub reset_in_ms: u64,
}

/// Sliding-window token bucket shared by every embedding caller
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: u32,
    interval: Duration,
    spent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(tokens_per_interval: u32, interval: Duration) -> Self {
        Self {
            max_tokens: tokens_per_interval.max(1),
            interval,
            spent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(config.tokens_per_interval, config.interval())
    }

    fn release_expired(&self, spent: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = spent.front() {
            if now.duration_since(*oldest) >= self.interval {
                spent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take a token if one is free right now
    pub async fn try_acquire(&self) -> bool {
        let mut spent = self.spent.lock().await;
        let now = Instant::now();
        self.release_expired(&mut spent, now);
        if spent.len() < self.max_tokens as usize {
            spent.push_back(now);
            true
        } else {
            false
        }
    }

    /// Take a token, waiting for one to return if the budget is spent
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut spent = self.spent.lock().await;
                let now = Instant::now();
                self.release_expired(&mut spent, now);
                if spent.len() < self.max_tokens as usize {
                    spent.push_back(now);
                    return;
                }
                match spent.front() {
                    Some(oldest) => (*oldest + self.interval).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            debug!(wait_ms = wait.as_millis() as u64, "Embedding rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn status(&self) -> RateLimiterStatus {
        let mut spent = self.spent.lock().await;
        let now = Instant::now();
        self.release_expired(&mut spent, now);

        let reset_in_ms = spent
            .front()
            .map(|oldest| (*oldest + self.interval).saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0);

        RateLimiterStatus {
            available_tokens: self.max_tokens.saturating_sub(spent.len() as u32),
            max_tokens: self.max_tokens,
            reset_in_ms,
        }
    }
}
