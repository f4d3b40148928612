//! Per-stage rate limiting.
//!
//! External quotas are per minute (LLM ~100/min, embeddings ~15/min). The
//! throttle spaces task starts evenly: workers share one throttle and each
//! acquires a slot before calling out.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Evenly-spaced rate limiter shared by a stage's workers.
pub struct StageThrottle {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl StageThrottle {
    /// A throttle for the given per-minute rate. Zero means unthrottled.
    pub fn per_minute(rate: u32) -> Self {
        let interval = if rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / rate as f64)
        };
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait until the next slot is free.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let wake_at = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = if *next > now { *next } else { now };
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(wake_at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unthrottled_is_immediate() {
        let throttle = StageThrottle::per_minute(0);
        let start = Instant::now();
        for _ in 0..100 {
            throttle.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_spacing_between_slots() {
        // 1200/min = one slot every 50ms
        let throttle = StageThrottle::per_minute(1200);
        let start = Instant::now();
        for _ in 0..4 {
            throttle.acquire().await;
        }
        // First slot immediate, three more spaced 50ms apart
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_shared_across_tasks() {
        use std::sync::Arc;
        let throttle = Arc::new(StageThrottle::per_minute(1200));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let throttle = throttle.clone();
            handles.push(tokio::spawn(async move { throttle.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
