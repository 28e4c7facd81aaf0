// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./retry_test.rs"]
mod retry_test;

use crate::{Error, Result};
use backoff::backoff::Backoff;
use backoff::exponential::{ExponentialBackoff, ExponentialBackoffBuilder};
use backoff::SystemClock;
use std::future::Future;
use std::io;
use std::time::Duration;

//
// RetryPolicy
//

/// How acquisition collisions are retried. The default performs no retries at all: a contended
/// lock surfaces `Locked` immediately and the caller decides what to do about it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Number of retries after the initial attempt.
  pub retries: u32,
  /// Delay before the first retry.
  pub min_timeout: Duration,
  /// Upper bound on the delay between retries.
  pub max_timeout: Duration,
  /// Multiplier applied to the delay after each retry.
  pub factor: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 0,
      min_timeout: Duration::from_secs(1),
      max_timeout: Duration::from_secs(60),
      factor: 2.0,
    }
  }
}

impl From<u32> for RetryPolicy {
  fn from(retries: u32) -> Self {
    Self {
      retries,
      ..Self::default()
    }
  }
}

impl RetryPolicy {
  fn backoff(&self) -> ExponentialBackoff<SystemClock> {
    ExponentialBackoffBuilder::<SystemClock>::new()
      .with_initial_interval(self.min_timeout)
      .with_multiplier(self.factor)
      .with_max_interval(self.max_timeout)
      .with_max_elapsed_time(None)
      .build()
  }
}

/// Collisions are worth retrying: the holder may release at any moment. Of the I/O errors only
/// the plausibly transient kinds are; a permission error will not get better by waiting.
fn is_retriable(error: &Error) -> bool {
  match error {
    Error::Locked(_) => true,
    Error::Io(e) => matches!(
      e.kind(),
      io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ),
    _ => false,
  }
}

/// Drive `attempt` until it succeeds, fails with a non-retriable error, or the retry budget runs
/// out.
pub(crate) async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut backoff = policy.backoff();
  let mut remaining = policy.retries;

  loop {
    match attempt().await {
      Ok(value) => return Ok(value),
      Err(e) if remaining > 0 && is_retriable(&e) => {
        remaining -= 1;
        let delay = backoff.next_backoff().unwrap_or(policy.max_timeout);
        log::debug!("lock attempt failed ({e}), retrying in {delay:?}");
        tokio::time::sleep(delay).await;
      },
      Err(e) => return Err(e),
    }
  }
}
