//! Exponential-backoff executor for operations that should survive
//! transient failure, like binding a busy port.
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};

/// Runs a fallible async operation with doubling backoff between attempts.
///
/// `timeout` bounds the *total* duration spent retrying; it also caps each
/// individual attempt to whatever budget remains. When the budget runs out
/// the last error is reported.
#[derive(Debug, Clone)]
pub struct Retrier {
    initial_delay: Duration,
    timeout: Duration,
}

impl Retrier {
    pub fn new(initial_delay: Duration, timeout: Duration) -> Self {
        Retrier {
            initial_delay,
            timeout,
        }
    }

    /// Run `op` until it succeeds or the time budget is exhausted.
    ///
    /// `on_error` is invoked after each failed attempt with the attempt
    /// number, the error, and the delay before the next attempt.
    pub async fn run<T, F, Fut, C>(&self, mut op: F, mut on_error: C) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: FnMut(u32, &Error, Duration),
    {
        let started = Instant::now();
        let mut delay = self.initial_delay;
        let mut attempt: u32 = 1;

        loop {
            let remaining = self
                .timeout
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(1));

            let result = match time::timeout(remaining, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "attempt timed out",
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    // Abort instead of sleeping past the budget.
                    if started.elapsed() + delay >= self.timeout {
                        return Err(Error::RetryTimeout {
                            elapsed: started.elapsed(),
                            last: Box::new(e),
                        });
                    }
                    on_error(attempt, &e, delay);
                    time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}
