use std::thread;
use std::time::Duration;

/// Bounded-retry policy for backend calls: up to `attempts` tries with a
/// fixed `wait` between them. Injected into each store at construction.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub attempts: u32,
    pub wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            wait: Duration::ZERO,
        }
    }
}

/// How a retried call ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently; the backend is treated as down.
    Exhausted { attempts: u32, last: E },
    /// A non-transient failure; surfaced as-is without further attempts.
    Failed(E),
}

/// Runs `op` under the policy. `transient` decides which failures are worth
/// another attempt; anything else returns immediately.
pub fn with_retry<T, E, F, P>(
    config: &RetryConfig,
    transient: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let attempts = config.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if transient(&e) && attempt < attempts => {
                tracing::debug!(attempt, attempts, "transient storage failure, retrying");
                if !config.wait.is_zero() {
                    thread::sleep(config.wait);
                }
            }
            Err(e) if transient(&e) => return Err(RetryError::Exhausted { attempts, last: e }),
            Err(e) => return Err(RetryError::Failed(e)),
        }
    }
}
