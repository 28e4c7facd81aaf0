// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

//
// OffsetDateTimeExt
//

pub trait OffsetDateTimeExt {
  fn unix_timestamp_ms(&self) -> i64;
}

impl OffsetDateTimeExt for OffsetDateTime {
  #[must_use]
  fn unix_timestamp_ms(&self) -> i64 {
    self.unix_timestamp() * 1_000 + i64::from(self.nanosecond() / 1_000_000)
  }
}

/// Builds a timestamp from milliseconds since the unix epoch.
#[must_use]
pub fn from_unix_timestamp_ms(ms: i64) -> OffsetDateTime {
  OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).unwrap()
}

//
// TimeProvider
//

#[async_trait::async_trait]
pub trait TimeProvider: Send + Sync {
  fn now(&self) -> OffsetDateTime;
  async fn sleep(&self, duration: time::Duration);
}

//
// SystemTimeProvider
//

pub struct SystemTimeProvider;

#[async_trait::async_trait]
impl TimeProvider for SystemTimeProvider {
  fn now(&self) -> OffsetDateTime {
    OffsetDateTime::now_utc()
  }
  async fn sleep(&self, duration: time::Duration) {
    tokio::time::sleep(duration.unsigned_abs()).await;
  }
}

//
// TestTimeProvider
//

#[derive(Clone)]
pub struct TestTimeProvider {
  now: Arc<Mutex<OffsetDateTime>>,
}

impl TestTimeProvider {
  #[must_use]
  pub fn new(now: OffsetDateTime) -> Self {
    Self {
      now: Arc::new(Mutex::new(now)),
    }
  }

  pub fn advance(&self, duration: time::Duration) {
    *self.now.lock() += duration;
  }

  pub fn set_time(&self, new_time: OffsetDateTime) {
    *self.now.lock() = new_time;
  }
}

#[async_trait::async_trait]
impl TimeProvider for TestTimeProvider {
  fn now(&self) -> OffsetDateTime {
    *self.now.lock()
  }

  async fn sleep(&self, duration: time::Duration) {
    // Tests never want a real sleep. The wall clock still has to move, since callers measure
    // elapsed time across sleeps.
    *self.now.lock() += duration;

    // A real sleep would yield to the executor, so this must too or callers can starve other
    // tasks by sleeping in a loop.
    tokio::task::yield_now().await;
  }
}
