use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::Duration;

struct Inner {
    counter: f64,
    rate: f64,
    window_start: Instant,
}

/// EWMA-smoothed observed send rate, for telemetry only (C2). Never gates
/// sending — only [`crate::rate_limiter::RateLimiter`] does that.
pub struct RateMeter {
    inner: Mutex<Inner>,
    alpha: f64,
    beta: f64,
    window: Duration,
}

impl RateMeter {
    pub fn new(alpha: f64, window_secs: f64) -> Self {
        RateMeter {
            inner: Mutex::new(Inner {
                counter: 0.0,
                rate: 0.0,
                window_start: Instant::now(),
            }),
            alpha,
            beta: 1.0 - alpha,
            window: Duration::from_secs_f64(window_secs),
        }
    }

    /// Rolls the smoothed rate forward if one or more windows have
    /// elapsed since `window_start`, per §4.2:
    /// `r <- beta^(k-1) * (beta*r + alpha*(counter/w))`.
    fn rollover(&self, inner: &mut Inner) {
        let w = self.window.as_secs_f64();
        let elapsed = inner.window_start.elapsed().as_secs_f64();

        if elapsed < w {
            return;
        }

        let k = (elapsed / w).floor() as i32;
        inner.rate = self.beta.powi(k - 1) * (self.beta * inner.rate + self.alpha * (inner.counter / w));
        inner.counter = 0.0;
        inner.window_start += self.window * (k as u32);
    }

    pub async fn count_up(&self, n: f64) {
        let mut inner = self.inner.lock().await;
        self.rollover(&mut inner);
        inner.counter += n;
    }

    pub async fn current_rate(&self) -> f64 {
        let mut inner = self.inner.lock().await;
        self.rollover(&mut inner);
        inner.rate
    }
}
