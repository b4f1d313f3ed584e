//! Frame rate limiting.

use std::time::{Duration, Instant};

/// Sleeps away whatever is left of the frame budget.
#[derive(Debug, Clone)]
pub struct FrameLimiter {
    budget: Option<Duration>,
    frame_start: Instant,
    last_frame_time: Duration,
}

impl FrameLimiter {
    /// `None` or a non-positive rate disables limiting.
    pub fn new(max_fps: Option<f32>) -> Self {
        let budget = max_fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps as f64));
        Self {
            budget,
            frame_start: Instant::now(),
            last_frame_time: Duration::ZERO,
        }
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// End the current frame, sleeping if it finished early.
    pub fn wait(&mut self) {
        let elapsed = self.frame_start.elapsed();
        if let Some(remaining) = self.budget.and_then(|b| b.checked_sub(elapsed)) {
            std::thread::sleep(remaining);
        }
        let now = Instant::now();
        self.last_frame_time = now - self.frame_start;
        self.frame_start = now;
    }

    /// Duration of the last frame, including the sleep.
    pub fn last_frame_time(&self) -> Duration {
        self.last_frame_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_does_not_sleep() {
        let mut limiter = FrameLimiter::new(None);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.wait();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(FrameLimiter::new(Some(0.0)).budget(), None);
    }

    #[test]
    fn test_limited_frames_take_at_least_budget() {
        let mut limiter = FrameLimiter::new(Some(100.0));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(29));
        assert!(limiter.last_frame_time() >= Duration::from_millis(9));
    }
}
