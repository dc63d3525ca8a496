//! Token bucket throttling of response bytes.
//!
//! Tokens are bytes. The bucket refills at the configured byte rate and
//! holds at most one second's worth, which bounds bursts.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Token bucket measured in bytes.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Burst size in bytes
    capacity: u64,
    tokens: u64,
    /// Bytes added per second
    refill_rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket. Zero values are raised to one.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(1),
            last_refill: Instant::now(),
        }
    }

    /// Takes up to `requested` tokens and returns how many were taken.
    pub fn consume(&mut self, requested: u64) -> u64 {
        self.refill();
        let consumed = requested.min(self.tokens);
        self.tokens -= consumed;
        consumed
    }

    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Time until `tokens` tokens are available, capped at a full bucket.
    pub fn time_until(&mut self, tokens: u64) -> Duration {
        self.refill();
        let deficit = tokens.min(self.capacity).saturating_sub(self.tokens);
        Duration::from_secs_f64(deficit as f64 / self.refill_rate as f64)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let added = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;
        if added > 0 {
            self.tokens = self.tokens.saturating_add(added).min(self.capacity);
            self.last_refill = now;
        }
    }
}

/// Async throttle shared by the writers of one response.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Limits throughput to `bytes_per_second` with a one second burst.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(bytes_per_second, bytes_per_second)),
        }
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().refill_rate()
    }

    /// Waits until `bytes` bytes may pass.
    ///
    /// Requests larger than the burst are granted in bucket-sized chunks.
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                remaining -= bucket.consume(remaining);
                if remaining == 0 {
                    return;
                }
                bucket.time_until(remaining)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_is_capped_by_available_tokens() {
        let mut bucket = TokenBucket::new(100, 10);
        assert_eq!(bucket.consume(90), 90);
        assert_eq!(bucket.consume(50), 10);
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(50, 1000);
        bucket.consume(50);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(bucket.available_tokens(), 50);
    }

    #[test]
    fn test_time_until_reflects_deficit() {
        let mut bucket = TokenBucket::new(1000, 1000);
        bucket.consume(1000);
        let wait = bucket.time_until(500);
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(500));
        // Anything beyond the capacity waits for a full bucket only.
        assert!(bucket.time_until(10_000) <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_limiter_paces_large_transfers() {
        let limiter = RateLimiter::new(10_000);
        let started = Instant::now();

        // The first 10 KB is the burst; the next 5 KB takes about half a second.
        limiter.acquire(10_000).await;
        limiter.acquire(5_000).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "finished in {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "finished in {elapsed:?}");
    }
}
