use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Counts rollback attempts inside a sliding time window.
#[derive(Debug, Clone)]
pub struct RollbackGuard {
    window: Duration,
    max_attempts: u32,
    attempts: VecDeque<DateTime<Utc>>,
}

impl RollbackGuard {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            window,
            max_attempts: max_attempts.max(1),
            attempts: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        while let Some(&t) = self.attempts.front() {
            if now - t >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one attempt at `now`; returns the count inside the window.
    pub fn record_attempt(&mut self, now: DateTime<Utc>) -> u32 {
        self.expire(now);
        self.attempts.push_back(now);
        self.attempts.len() as u32
    }

    pub fn attempts_in_window(&self, now: DateTime<Utc>) -> u32 {
        self.attempts.iter().filter(|&&t| now - t < self.window).count() as u32
    }

    /// True once the window holds `max_attempts` attempts.
    pub fn exhausted(&self, now: DateTime<Utc>) -> bool {
        self.attempts_in_window(now) >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }
}
