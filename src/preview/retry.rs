use std::future::Future;
use std::time::Duration;

/// Bounded fixed-delay retry: at most `max_attempts` probes, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Ready { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Database readiness: 30 probes, 2s apart.
    pub const fn database_ready() -> Self {
        Self::fixed(30, Duration::from_secs(2))
    }

    /// Call `probe` until it yields `Some`, sleeping `delay` between
    /// attempts. The attempt number (1-based) is passed to the probe. No
    /// sleep follows the final attempt.
    pub async fn run<T, F, Fut>(&self, mut probe: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = probe(attempt).await {
                return RetryOutcome::Ready {
                    value,
                    attempts: attempt,
                };
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        RetryOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }
}
