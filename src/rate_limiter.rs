//! Token-bucket admission control for outbound provider calls.

use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::types::RateLimitConfig;

/// Token bucket shared by every outbound call of a gateway.
///
/// Each token taken from the bucket returns to it exactly one interval later,
/// so no window of `interval` length ever sees more than `max_requests`
/// acquisitions.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug)]
struct RateLimiterState {
    tokens: u32,
    /// Refill instants of tokens currently out of the bucket, oldest first.
    pending_refills: VecDeque<Instant>,
}

impl RateLimiterState {
    fn refill(&mut self, now: Instant) {
        while let Some(&due) = self.pending_refills.front() {
            if due > now {
                break;
            }
            self.pending_refills.pop_front();
            self.tokens += 1;
        }
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let state = RateLimiterState {
            tokens: config.max_requests,
            pending_refills: VecDeque::new(),
        };

        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Take one token, suspending until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill(now);

                if state.tokens > 0 {
                    state.tokens -= 1;
                    state.pending_refills.push_back(now + self.config.interval);
                    return;
                }

                match state.pending_refills.front() {
                    Some(&due) => due,
                    // Unreachable with a non-zero bucket, but never spin
                    None => now + self.config.interval,
                }
            };

            debug!("Rate limiter exhausted, waiting for next token");
            sleep_until(wait_until).await;
        }
    }

    /// Take one token if available without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refill(now);

        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        state.pending_refills.push_back(now + self.config.interval);
        true
    }

    /// Tokens currently available.
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.refill(Instant::now());
        state.tokens
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
