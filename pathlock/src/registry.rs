// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./registry_test.rs"]
mod registry_test;

use crate::acquire::Acquired;
use crate::probe::{mtimes_equal, MtimePrecision};
use crate::{CompromisedReason, Error, OnCompromised, Result, Timings};
use parking_lot::Mutex;
use pathlock_fs::FileSystem;
use pathlock_time::{from_unix_timestamp_ms, OffsetDateTimeExt, TimeProvider};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use time::OffsetDateTime;
use tokio::sync::oneshot;

const RECOVERY_DELAY_MS: i64 = 1_000;

// Lock order is REGISTRY before Shared::state, everywhere. Neither lock is ever held across an
// await.
static REGISTRY: LazyLock<Mutex<HashMap<PathBuf, Arc<Shared>>>> = LazyLock::new(Mutex::default);

//
// Shared
//

/// One held lock. Owned by the registry; the refresher task and the guard hold extra references
/// but every mutation re-checks `released` first, so a record that has been released or
/// compromised is inert no matter who still points at it.
struct Shared {
  key: PathBuf,
  sentinel: PathBuf,
  fs: Arc<dyn FileSystem>,
  time: Arc<dyn TimeProvider>,
  precision: MtimePrecision,
  stale_ms: Option<i64>,
  update_ms: i64,
  on_compromised: Arc<dyn OnCompromised>,
  state: Mutex<State>,
}

struct State {
  /// The last mtime this holder wrote to the sentinel.
  mtime: OffsetDateTime,
  /// When the sentinel was last successfully refreshed (or acquired).
  last_refresh: OffsetDateTime,
  /// Delay before the next refresh tick; dropped to the recovery delay after transient errors.
  next_delay_ms: i64,
  /// Terminal. Set by unlock, guard drop, or compromise; nothing mutates past it.
  released: bool,
  /// Dropping this cancels the refresher task.
  shutdown: Option<oneshot::Sender<()>>,
}

pub(crate) fn is_held(key: &Path) -> bool {
  REGISTRY.lock().contains_key(key)
}

/// The canonical keys of every lock currently held by this process. Exposed so hosts can audit
/// held locks and tests can assert on registry contents.
#[must_use]
pub fn held() -> Vec<PathBuf> {
  REGISTRY.lock().keys().cloned().collect()
}

/// Record a successful acquisition and start its refresher. A record already present under the
/// key means two acquisitions raced inside this process, which the caller surfaces as an
/// ordinary collision.
pub(crate) fn register(
  key: PathBuf,
  sentinel: PathBuf,
  acquired: Acquired,
  timings: Timings,
  fs: Arc<dyn FileSystem>,
  time: Arc<dyn TimeProvider>,
  on_compromised: Arc<dyn OnCompromised>,
) -> Result<LockGuard> {
  let refresh = timings.update_ms > 0;
  let (shutdown_tx, shutdown_rx) = oneshot::channel();

  let now = time.now();
  let shared = Arc::new(Shared {
    key,
    sentinel,
    fs,
    time,
    precision: acquired.precision,
    stale_ms: timings.stale_ms,
    update_ms: timings.update_ms,
    on_compromised,
    state: Mutex::new(State {
      mtime: acquired.mtime,
      last_refresh: now,
      next_delay_ms: timings.update_ms,
      released: false,
      shutdown: refresh.then_some(shutdown_tx),
    }),
  });

  {
    let mut registry = REGISTRY.lock();
    if registry.contains_key(&shared.key) {
      return Err(Error::Locked(shared.sentinel.clone()));
    }
    registry.insert(shared.key.clone(), shared.clone());
  }

  if refresh {
    spawn_refresher(shared.clone(), shutdown_rx);
  }

  Ok(LockGuard {
    shared,
    released: false,
  })
}

//
// Refresher
//

fn spawn_refresher(shared: Arc<Shared>, mut shutdown_rx: oneshot::Receiver<()>) {
  tokio::spawn(async move {
    loop {
      let delay = shared.state.lock().next_delay_ms;
      tokio::select! {
        () = shared.time.sleep(time::Duration::milliseconds(delay)) => {
          if !tick(&shared).await {
            return;
          }
        },
        _ = &mut shutdown_rx => return,
      }
    }
  });
}

/// One refresh tick. Returns whether the refresher should keep running. Every await is followed
/// by a `released` re-check: an explicit unlock may run while our filesystem call is in flight,
/// and from that point on the sentinel may belong to somebody else.
async fn tick(shared: &Arc<Shared>) -> bool {
  if shared.state.lock().released {
    return false;
  }

  let stat = shared.fs.metadata(&shared.sentinel).await;

  let (released, last_refresh, our_mtime) = {
    let state = shared.state.lock();
    (state.released, state.last_refresh, state.mtime)
  };
  if released {
    return false;
  }

  let now = shared.time.now();
  let over_threshold = is_over_threshold(shared.stale_ms, last_refresh, now);

  let metadata = match stat {
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      compromise(shared, CompromisedReason::SentinelMissing);
      return false;
    },
    Err(e) => {
      if over_threshold {
        compromise(shared, CompromisedReason::StaleThreshold);
        return false;
      }
      log::warn!(
        "failed to stat lock sentinel {}, retrying shortly: {e}",
        shared.sentinel.display()
      );
      shared.state.lock().next_delay_ms = RECOVERY_DELAY_MS;
      return true;
    },
    Ok(metadata) => metadata,
  };

  if over_threshold {
    compromise(shared, CompromisedReason::StaleThreshold);
    return false;
  }

  if !mtimes_equal(metadata.mtime, our_mtime, shared.precision) {
    // Somebody reclaimed the sentinel as stale, or rewrote its mtime out from under us.
    compromise(shared, CompromisedReason::MtimeDrift);
    return false;
  }

  // On whole-second devices write the next second boundary so that truncation stores exactly
  // what we recorded.
  let now_ms = now.unix_timestamp_ms();
  let write_ms = match shared.precision {
    MtimePrecision::Second => (now_ms + 999).div_euclid(1_000) * 1_000,
    MtimePrecision::Millisecond => now_ms,
  };
  let write = from_unix_timestamp_ms(write_ms);

  let written = shared.fs.set_times(&shared.sentinel, write).await;

  let mut state = shared.state.lock();
  if state.released {
    return false;
  }

  match written {
    Ok(()) => {
      state.mtime = write;
      state.last_refresh = shared.time.now();
      state.next_delay_ms = shared.update_ms;
      true
    },
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      drop(state);
      compromise(shared, CompromisedReason::SentinelMissing);
      false
    },
    Err(e) => {
      let last_refresh = state.last_refresh;
      drop(state);
      if is_over_threshold(shared.stale_ms, last_refresh, shared.time.now()) {
        compromise(shared, CompromisedReason::StaleThreshold);
        false
      } else {
        log::warn!(
          "failed to refresh lock sentinel {}, retrying shortly: {e}",
          shared.sentinel.display()
        );
        shared.state.lock().next_delay_ms = RECOVERY_DELAY_MS;
        true
      }
    },
  }
}

// A clock that stepped backwards reads as "not over": treating a regression as a missed refresh
// would compromise a perfectly healthy lock.
fn is_over_threshold(
  stale_ms: Option<i64>,
  last_refresh: OffsetDateTime,
  now: OffsetDateTime,
) -> bool {
  stale_ms.is_some_and(|stale_ms| {
    now > last_refresh && (now - last_refresh).whole_milliseconds() > i128::from(stale_ms)
  })
}

/// Tear the record down and deliver the compromise. The handler is cloned out and invoked with
/// every lock released: it may re-enter the public API (including re-locking this very key), and
/// it outlives the registry entry it is reporting on.
fn compromise(shared: &Arc<Shared>, reason: CompromisedReason) {
  {
    let mut registry = REGISTRY.lock();
    let mut state = shared.state.lock();
    if state.released {
      return;
    }
    state.released = true;
    state.shutdown = None;
    drop(state);
    registry.remove(&shared.key);
  }

  log::warn!(
    "lock on {} was compromised: {reason}",
    shared.key.display()
  );
  let handler = shared.on_compromised.clone();
  handler.on_compromised(Error::Compromised(reason));
}

//
// Unlock
//

/// Explicit unlock by canonical key. Fails with `NotAcquired` when this process holds no lock on
/// the key.
pub(crate) async fn unlock(key: &Path) -> Result<()> {
  let shared = REGISTRY
    .lock()
    .get(key)
    .cloned()
    .ok_or_else(|| Error::NotAcquired(key.to_path_buf()))?;

  unlock_shared(&shared).await
}

async fn unlock_shared(shared: &Arc<Shared>) -> Result<()> {
  {
    let mut registry = REGISTRY.lock();
    let mut state = shared.state.lock();
    if state.released {
      // Compromised (or unlocked twice concurrently); the sentinel is not ours to remove.
      return Ok(());
    }
    state.released = true;
    state.shutdown = None;
    drop(state);
    registry.remove(&shared.key);
  }

  // Ownership is relinquished above regardless of whether this removal succeeds: a record we
  // can no longer refresh must not linger in the registry.
  shared.fs.remove_dir(&shared.sentinel).await?;
  log::debug!("released lock sentinel {}", shared.sentinel.display());
  Ok(())
}

/// Release every lock held by this process, logging (not surfacing) individual failures. Used by
/// the shutdown path and by tests that must not leak sentinels.
pub async fn release_all() {
  let all: Vec<_> = REGISTRY.lock().values().cloned().collect();
  for shared in all {
    if let Err(e) = unlock_shared(&shared).await {
      log::warn!(
        "failed to release lock on {} during sweep: {e}",
        shared.key.display()
      );
    }
  }
}

//
// LockGuard
//

/// The release handle returned by a successful lock. Explicitly releasing twice fails with
/// `AlreadyReleased`; dropping an unreleased guard performs a best-effort synchronous cleanup so
/// that a process which exits normally leaves no sentinel behind.
pub struct LockGuard {
  shared: Arc<Shared>,
  released: bool,
}

impl std::fmt::Debug for LockGuard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LockGuard")
      .field("key", &self.shared.key)
      .field("released", &self.released)
      .finish()
  }
}

impl LockGuard {
  /// The canonical key this guard locks.
  #[must_use]
  pub fn key(&self) -> &Path {
    &self.shared.key
  }

  /// The sentinel directory backing the lock.
  #[must_use]
  pub fn sentinel(&self) -> &Path {
    &self.shared.sentinel
  }

  /// Release the lock. After a compromise this resolves without touching the filesystem: the
  /// sentinel may already belong to another party, and removing it would break their lock.
  pub async fn release(&mut self) -> Result<()> {
    if self.released {
      return Err(Error::AlreadyReleased);
    }
    self.released = true;
    unlock_shared(&self.shared).await
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    if self.released {
      return;
    }

    {
      let mut registry = REGISTRY.lock();
      let mut state = self.shared.state.lock();
      if state.released {
        return;
      }
      state.released = true;
      state.shutdown = None;
      drop(state);
      registry.remove(&self.shared.key);
    }

    if let Err(e) = self.shared.fs.remove_dir_blocking(&self.shared.sentinel) {
      log::warn!(
        "failed to remove lock sentinel {} on drop: {e}",
        self.shared.sentinel.display()
      );
    }
  }
}
