use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::Duration;

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Token bucket shared by every sender worker (C1).
///
/// Ported from `nuntius.utils.processes.TokenBucket`. The original holds a
/// single `multiprocessing.RLock` for the entire duration of `take`,
/// including the blocking `sleep` when the bucket runs dry — this
/// serializes every caller on one lock and is what gives the "FIFO on the
/// serialization lock is sufficient" fairness guarantee of §4.1. The same
/// shape is kept here: `take` holds the `tokio::sync::Mutex` guard across
/// the `await` sleep rather than releasing it early.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    capacity: f64,
    rate: f64,
}

impl RateLimiter {
    pub fn new(capacity: f64, rate: f64) -> Self {
        RateLimiter {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_update: Instant::now(),
            }),
            capacity,
            rate,
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + self.rate * elapsed).min(self.capacity);
        bucket.last_update = now;
    }

    /// Atomically refills then subtracts `n` tokens, suspending the
    /// caller if the bucket goes negative (§4.1).
    pub async fn take(&self, n: f64) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens -= n;

        if bucket.tokens < 0.0 {
            let wait = Duration::from_secs_f64(-bucket.tokens / self.rate);
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token count after a refill, without consuming any.
    pub async fn peek(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}
