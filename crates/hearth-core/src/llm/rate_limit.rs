//! Per-provider request throttling: a sliding-window RPM cap plus a
//! concurrency semaphore.
//!
//! Callers `acquire()` before each request; the returned permit releases
//! the concurrency slot on drop. Excess requests queue until a slot frees
//! up or the caller's own deadline fires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Sliding-window RPM limiter + concurrency cap.
pub struct RateLimiter {
    rpm_limit: u32,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
    concurrency: Arc<Semaphore>,
}

/// Held for the duration of one request.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    /// `rpm_limit = 0` disables the RPM window; `concurrency` must be ≥ 1.
    pub fn new(rpm_limit: u32, concurrency: u32) -> Self {
        Self {
            rpm_limit,
            window: Duration::from_secs(60),
            recent: Mutex::new(VecDeque::new()),
            concurrency: Arc::new(Semaphore::new(concurrency.max(1) as usize)),
        }
    }

    #[cfg(test)]
    fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Wait for both an RPM slot and a concurrency slot.
    pub async fn acquire(&self) -> RatePermit {
        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("rate limiter semaphore closed");

        if self.rpm_limit > 0 {
            loop {
                let wait = {
                    let mut recent = self.recent.lock().await;
                    let cutoff = Instant::now().checked_sub(self.window);
                    while cutoff.is_some_and(|c| recent.front().is_some_and(|t| *t < c)) {
                        recent.pop_front();
                    }
                    if (recent.len() as u32) < self.rpm_limit {
                        recent.push_back(Instant::now());
                        None
                    } else {
                        // Oldest entry decides how long until a slot opens.
                        recent
                            .front()
                            .map(|t| (*t + self.window).saturating_duration_since(Instant::now()))
                    }
                };
                match wait {
                    None => break,
                    Some(delay) => tokio::time::sleep(delay.max(Duration::from_millis(10))).await,
                }
            }
        }

        RatePermit { _permit: permit }
    }

    /// Requests currently admitted inside the window (test/metrics hook).
    pub async fn in_window(&self) -> usize {
        let mut recent = self.recent.lock().await;
        let cutoff = Instant::now().checked_sub(self.window);
        while cutoff.is_some_and(|c| recent.front().is_some_and(|t| *t < c)) {
            recent.pop_front();
        }
        recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_cap_blocks_third_caller() {
        let limiter = Arc::new(RateLimiter::new(0, 2));

        let p1 = limiter.acquire().await;
        let _p2 = limiter.acquire().await;

        let limiter2 = Arc::clone(&limiter);
        let blocked = tokio::spawn(async move {
            let _p3 = limiter2.acquire().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "third acquire should be queued");

        drop(p1);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("third acquire should proceed after a release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_rpm_window_admits_up_to_limit() {
        let limiter = RateLimiter::new(3, 10).with_window(Duration::from_secs(60));
        let _a = limiter.acquire().await;
        let _b = limiter.acquire().await;
        let _c = limiter.acquire().await;
        assert_eq!(limiter.in_window().await, 3);
    }

    #[tokio::test]
    async fn test_rpm_window_delays_excess() {
        let limiter = Arc::new(RateLimiter::new(1, 10).with_window(Duration::from_millis(200)));
        let _a = limiter.acquire().await;

        let started = Instant::now();
        let _b = limiter.acquire().await;
        assert!(
            started.elapsed() >= Duration::from_millis(100),
            "second acquire should wait for the window to slide"
        );
    }

    #[tokio::test]
    async fn test_zero_rpm_means_unlimited() {
        let limiter = RateLimiter::new(0, 4);
        for _ in 0..20 {
            let _p = limiter.acquire().await;
        }
        assert_eq!(limiter.in_window().await, 0);
    }
}
