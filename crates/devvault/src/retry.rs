//! Bounded polling
//!
//! Waiting for the store after a restart is the only place we block on
//! something outside our control. Every wait goes through [`poll`], which
//! gives up after a fixed number of attempts and says so in its return
//! type.

use std::thread;
use std::time::{Duration, Instant};

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same interval every time
    Fixed,
    /// Double the interval after each attempt, capped at `max`
    Exponential { max: Duration },
}

/// How long and how often to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(interval: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: Backoff::Exponential { max },
        }
    }

    /// Delay to sleep after the given (zero-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }

    /// Worst-case time spent sleeping
    pub fn budget(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|a| self.delay_after(a))
            .sum()
    }
}

impl Default for RetryPolicy {
    /// 20 attempts backing off from 250ms to 2s, about half a minute in all
    fn default() -> Self {
        Self::exponential(Duration::from_millis(250), Duration::from_secs(2), 20)
    }
}

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    TimedOut { attempts: u32, elapsed: Duration },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Call `check` until it yields a value or the policy runs out.
pub fn poll<T, F>(policy: &RetryPolicy, mut check: F) -> PollOutcome<T>
where
    F: FnMut(u32) -> Option<T>,
{
    let started = Instant::now();
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        if let Some(value) = check(attempt) {
            return PollOutcome::Ready {
                value,
                attempts: attempt + 1,
            };
        }
        if attempt + 1 < attempts {
            let delay = policy.delay_after(attempt);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    PollOutcome::TimedOut {
        attempts,
        elapsed: started.elapsed(),
    }
}
