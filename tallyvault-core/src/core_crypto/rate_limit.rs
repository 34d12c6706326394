//! Rate limiting for bulk encryption work
//!
//! Re-encryption during key rotation and bulk imports can touch every field
//! a company owns. The [`BatchLimiter`] paces that work with a token bucket
//! so interactive writes keep getting CPU and storage time.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Limiter configuration
#[derive(Debug, Clone, Copy)]
pub struct BatchLimitConfig {
    /// Sustained rate in fields per second
    pub fields_per_second: u32,

    /// Bucket capacity (largest burst allowed without waiting)
    pub burst: u32,
}

impl Default for BatchLimitConfig {
    fn default() -> Self {
        Self {
            fields_per_second: 2_000,
            burst: 500,
        }
    }
}

/// Token bucket
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens available
    tokens: f64,

    /// Maximum tokens (bucket capacity)
    capacity: f64,

    /// Last time tokens were refilled
    last_refill: Instant,

    /// Refill rate (tokens per second)
    refill_rate: f64,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: u32) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            last_refill: Instant::now(),
            refill_rate: refill_rate as f64,
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume `n` tokens if available, otherwise report how long to wait
    fn try_consume(&mut self, n: f64) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            Ok(())
        } else {
            let missing = n - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }
}

/// Async token-bucket limiter shared by bulk encryption tasks
#[derive(Debug)]
pub struct BatchLimiter {
    config: BatchLimitConfig,
    bucket: Mutex<TokenBucket>,
}

impl BatchLimiter {
    pub fn new(config: BatchLimitConfig) -> Self {
        let config = BatchLimitConfig {
            fields_per_second: config.fields_per_second.max(1),
            burst: config.burst.max(1),
        };
        Self {
            bucket: Mutex::new(TokenBucket::new(config.burst, config.fields_per_second)),
            config,
        }
    }

    pub fn config(&self) -> BatchLimitConfig {
        self.config
    }

    /// Wait until `fields` tokens are available and take them.
    ///
    /// Requests larger than the burst size are split into burst-sized chunks.
    pub async fn acquire(&self, fields: u32) {
        let mut remaining = fields;
        while remaining > 0 {
            let chunk = remaining.min(self.config.burst);
            loop {
                let wait = {
                    let mut bucket = self.bucket.lock().await;
                    match bucket.try_consume(chunk as f64) {
                        Ok(()) => break,
                        Err(wait) => wait,
                    }
                };
                tokio::time::sleep(wait).await;
            }
            remaining -= chunk;
        }
    }

    /// Take `fields` tokens only if they are available right now
    pub async fn try_acquire(&self, fields: u32) -> bool {
        let mut bucket = self.bucket.lock().await;
        bucket.try_consume(fields as f64).is_ok()
    }
}
