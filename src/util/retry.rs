use crate::kv::StoreError;
use log::{debug, warn};
use rand::{thread_rng, Rng};
use std::thread;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// Bounded retry schedule for operations against the external store.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(RetryStrategy::Linear, 1, Duration::ZERO)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = (!max_delay.is_zero()).then_some(max_delay);
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(16) as u32;
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor =
            thread_rng().gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        bounded.mul_f64(factor)
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once the attempts are spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. Only [`StoreError::is_transient`] failures
/// are retried; the whole operation is repeated each time.
pub fn retry_store_op<T, F>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut handle = policy.handle();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => match handle.next_delay() {
                Some(delay) => {
                    debug!(
                        "event=store_op_retry op={} attempt={} delay_ms={} error={}",
                        op_name,
                        handle.attempts(),
                        delay.as_millis(),
                        err
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                None => {
                    warn!(
                        "event=store_op_exhausted op={} attempts={} error={}",
                        op_name,
                        policy.max_attempts(),
                        err
                    );
                    return Err(err);
                }
            },
            Err(err) => return Err(err),
        }
    }
}
