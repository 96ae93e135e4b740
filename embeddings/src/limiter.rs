//! Token-bucket rate limiting for provider requests.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{EmbeddingError, Result};

/// Token bucket shared by every caller of one adapter.
///
/// Callers wait for a token rather than failing; a caller that cannot get
/// one within its timeout fails with [`EmbeddingError::Timeout`].
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket refilling at `rate_per_sec` that holds at most `burst` tokens.
    /// It starts full.
    pub fn new(rate_per_sec: f64, burst: u32) -> Result<Self> {
        if !rate_per_sec.is_finite() || rate_per_sec <= 0.0 {
            return Err(EmbeddingError::InvalidConfiguration(format!(
                "request rate must be positive, got {rate_per_sec}"
            )));
        }
        let burst = f64::from(burst.max(1));
        Ok(Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Take one token, waiting at most `timeout` for it.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_sec)
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(EmbeddingError::Timeout(timeout));
            }
            debug!("Rate limited, waiting {wait:?} for a request token");
            tokio::time::sleep_until((now + wait).min(deadline)).await;
        }
    }

    /// Tokens currently available, after refill.
    pub async fn available(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = Instant::now()
            .saturating_duration_since(state.last_refill)
            .as_secs_f64();
        (state.tokens + elapsed * self.rate_per_sec).min(self.burst)
    }
}
