use std::{cell::Cell, fmt, time::Duration};

use backoff::backoff::Backoff;
use log::{debug, warn};
use rand::{rngs::ThreadRng, Rng};

/// How long to wait between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Fixed(Duration),
    /// The wait after the k-th failed attempt is drawn uniformly from `[0, min(base * 2^(k-1), cap)]`.
    JitteredExponential { base: Duration, cap: Duration },
}

impl Delay {
    /// Upper bound of the wait after the given failed attempt, counting from 1.
    pub fn max_delay(&self, attempt: u32) -> Duration {
        match *self {
            Delay::Fixed(delay) => delay,
            Delay::JitteredExponential { base, cap } => 2u32
                .checked_pow(attempt.saturating_sub(1))
                .and_then(|factor| base.checked_mul(factor))
                .map_or(cap, |delay| delay.min(cap)),
        }
    }

    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        match self {
            Delay::Fixed(delay) => *delay,
            Delay::JitteredExponential { .. } => {
                self.max_delay(attempt).mul_f64(rng.gen_range(0.0..=1.0))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Delay,
}

/// Three attempts, one second apart.
pub const BUILD_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    delay: Delay::Fixed(Duration::from_secs(1)),
};

/// Ten attempts with jittered exponential backoff capped at 15 seconds.
pub const PUSH_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 10,
    delay: Delay::JitteredExponential {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(15),
    },
};

/// The waits of one retry loop. Ends once `max_attempts` attempts have failed.
#[derive(Debug)]
pub struct Schedule {
    policy: RetryPolicy,
    failures: u32,
    rng: ThreadRng,
}

impl Backoff for Schedule {
    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay.delay(self.failures, &mut self.rng))
    }
}

/// Waits through `sleep` and hands a zero wait back to the retry loop.
struct Paced<'a, B> {
    inner: B,
    sleep: &'a dyn Fn(Duration),
}

impl<B: Backoff> Backoff for Paced<'_, B> {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.inner.next_backoff()?;
        debug!("retrying in {delay:.1?}");
        (self.sleep)(delay);
        Some(Duration::ZERO)
    }
}

impl RetryPolicy {
    pub fn schedule(&self) -> Schedule {
        Schedule {
            policy: *self,
            failures: 0,
            rng: rand::thread_rng(),
        }
    }

    /// Calls `op` with the attempt number until it succeeds or the attempts run out. `sleep` is
    /// called with the backoff between attempts.
    pub fn run<T, E, F>(&self, sleep: &dyn Fn(Duration), mut op: F) -> Result<T, RetriesExhausted<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let policy = RetryPolicy {
            max_attempts,
            ..*self
        };
        let attempts = Cell::new(0);
        let result = backoff::retry_notify(
            Paced {
                inner: policy.schedule(),
                sleep,
            },
            || {
                attempts.set(attempts.get() + 1);
                op(attempts.get()).map_err(backoff::Error::transient)
            },
            |error: E, _: Duration| {
                warn!("attempt {}/{max_attempts} failed: {error}", attempts.get());
            },
        );
        result.map_err(|error| RetriesExhausted {
            attempts: attempts.get(),
            last: match error {
                backoff::Error::Permanent(error) | backoff::Error::Transient { err: error, .. } => error,
            },
        })
    }
}

#[derive(Debug)]
pub struct RetriesExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetriesExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up after {attempts} attempts: {last}",
            attempts = self.attempts,
            last = self.last
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetriesExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last)
    }
}
