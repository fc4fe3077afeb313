// openweather_connector - OpenWeather observations connector
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded exponential backoff with random jitter.
///
/// The wait before attempt `n + 1` is `initial_backoff * 2^(n - 1)`, capped at `max_backoff`,
/// plus a random amount up to `jitter`. No operation wrapped in a policy runs longer than
/// `max_attempts` calls plus `(max_attempts - 1) * (max_backoff + jitter)` of waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy for upstream weather requests: three attempts, 2s initial wait, 8s ceiling.
    pub fn fetch() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(8),
            jitter: Duration::from_secs(1),
        }
    }

    /// Policy for downstream delivery, which is allowed to wait longer than fetches.
    pub fn send() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// How long to wait after failed attempt number `attempt` (starting at one).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .initial_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff);

        let jitter_millis = self.jitter.as_millis() as u64;
        let jitter = if jitter_millis > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
        } else {
            Duration::ZERO
        };

        // Jitter applies on top of the cap
        base.min(self.max_backoff) + jitter
    }

    /// Run `op` until it succeeds, fails with an error `should_retry` rejects, or the
    /// attempts are exhausted. The last error is returned in the latter two cases.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    let wait = self.backoff(attempt);
                    tracing::debug!(
                        message = "retrying after failed attempt",
                        attempt = attempt,
                        max_attempts = max_attempts,
                        wait_millis = wait.as_millis() as u64,
                        error = %e,
                    );

                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like `run` using the error's own `Retryable` classification.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        self.run(op, |e: &E| e.is_retryable()).await
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fetch()
    }
}
