//! Two-tier phase deadlines.
//!
//! A phase has an *expected* duration and a *maximum* duration. Finishing after
//! the expected duration is reported as [`DeadlineOutcome::Late`] and logged as a
//! warning; exceeding the maximum cancels the operation and yields
//! [`HardDeadlineExceeded`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Expected and maximum duration of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    /// Soft deadline
    pub expected: Duration,
    /// Hard deadline
    pub max: Duration,
}

impl Deadlines {
    /// Build from a `(soft, hard)` pair.
    pub fn new((expected, max): (Duration, Duration)) -> Self {
        Self { expected, max }
    }
}

/// Result of an operation that finished before its hard deadline.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadlineOutcome<T> {
    /// Finished within the expected duration
    OnTime(T),
    /// Finished after the expected duration
    Late {
        /// Operation result
        value: T,
        /// Time taken
        elapsed: Duration,
    },
}

impl<T> DeadlineOutcome<T> {
    /// The operation result, regardless of lateness.
    pub fn into_value(self) -> T {
        match self {
            DeadlineOutcome::OnTime(value) | DeadlineOutcome::Late { value, .. } => value,
        }
    }

    /// Time taken, if the operation was late.
    pub fn lateness(&self) -> Option<Duration> {
        match self {
            DeadlineOutcome::OnTime(_) => None,
            DeadlineOutcome::Late { elapsed, .. } => Some(*elapsed),
        }
    }
}

/// The operation was still running at its hard deadline and has been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardDeadlineExceeded(pub Duration);

/// Run `operation` under two-tier deadlines.
///
/// A warning naming `phase` is logged as soon as the expected duration passes,
/// without interrupting the operation.
pub async fn with_deadlines<F, T>(
    phase: &str,
    deadlines: Deadlines,
    operation: F,
) -> Result<DeadlineOutcome<T>, HardDeadlineExceeded>
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let hard_deadline = started + deadlines.max;
    tokio::pin!(operation);

    let soft = tokio::time::sleep(deadlines.expected);
    tokio::pin!(soft);
    let mut warned = false;

    loop {
        tokio::select! {
            value = &mut operation => {
                let elapsed = started.elapsed();
                return Ok(if elapsed > deadlines.expected {
                    DeadlineOutcome::Late { value, elapsed }
                } else {
                    DeadlineOutcome::OnTime(value)
                });
            }
            _ = &mut soft, if !warned => {
                warned = true;
                tracing::warn!(
                    phase,
                    expected = ?deadlines.expected,
                    max = ?deadlines.max,
                    "Phase exceeded its expected duration"
                );
            }
            _ = tokio::time::sleep_until(hard_deadline) => {
                tracing::error!(phase, max = ?deadlines.max, "Phase exceeded its maximum duration");
                return Err(HardDeadlineExceeded(deadlines.max));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn readout() -> Deadlines {
        Deadlines::new((Duration::from_secs(40), Duration::from_secs(60)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_time() {
        let outcome = with_deadlines("READING", readout(), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            7
        })
        .await
        .unwrap();
        assert_eq!(outcome, DeadlineOutcome::OnTime(7));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_late_is_a_warning_not_an_error() {
        let outcome = with_deadlines("READING", readout(), async {
            tokio::time::sleep(Duration::from_secs(45)).await;
        })
        .await
        .unwrap();
        assert!(outcome.lateness().unwrap() >= Duration::from_secs(45));
        assert!(logs_contain("exceeded its expected duration"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_deadline_cancels() {
        let result = with_deadlines("READING", readout(), async {
            tokio::time::sleep(Duration::from_secs(65)).await;
        })
        .await;
        assert_eq!(result, Err(HardDeadlineExceeded(Duration::from_secs(60))));
    }
}
