// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Advisory, cooperative file locking that works across processes and machines sharing a
//! filesystem, including network filesystems.
//!
//! A lock is an empty sentinel directory next to the target (`<target>.lock`), created with the
//! one primitive shared filesystems make atomic. The holder keeps the sentinel's mtime fresh
//! from a background task; a sentinel that stops being refreshed is considered stale after a
//! threshold and gets reclaimed by the next contender. The refresher also watches the sentinel
//! itself, and reports through a compromise handler the moment the lock demonstrably stops
//! being ours.
//!
//! Everybody competing for a target must use the same protocol with the same stale threshold;
//! nothing here stops an uncooperative process from ignoring locks entirely.

mod acquire;
mod path;
mod probe;
pub mod registry;
mod retry;
pub mod shutdown;
pub mod sync;

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

use pathlock_fs::{FileSystem, RealFileSystem};
use pathlock_time::{SystemTimeProvider, TimeProvider};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use probe::MtimePrecision;
pub use registry::{held, release_all, LockGuard};
pub use retry::RetryPolicy;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  pathlock_test_helpers::test_global_init();
}

const DEFAULT_STALE: Duration = Duration::from_secs(10);
const STALE_FLOOR_MS: i64 = 2_000;
const UPDATE_FLOOR_MS: i64 = 1_000;

//
// Error
//

#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// The sentinel exists and is not stale; somebody else holds the lock.
  #[error("lock is already being held on {}", .0.display())]
  Locked(PathBuf),
  #[error("lock on {} is not acquired/owned by this process", .0.display())]
  NotAcquired(PathBuf),
  #[error("lock is already released")]
  AlreadyReleased,
  /// Delivered through the compromise handler, never returned from the public operations.
  #[error("lock was compromised: {0}")]
  Compromised(CompromisedReason),
  #[error("cannot use retries with the sync api")]
  SyncRetriesUnsupported,
  #[error(transparent)]
  Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// Stable string code for the error, for hosts that dispatch on codes rather than types.
  /// I/O errors pass their underlying condition through (notably `ENOENT`).
  #[must_use]
  pub fn code(&self) -> &'static str {
    match self {
      Self::Locked(_) => "ELOCKED",
      Self::NotAcquired(_) => "ENOTACQUIRED",
      Self::AlreadyReleased => "ERELEASED",
      Self::Compromised(_) => "ECOMPROMISED",
      Self::SyncRetriesUnsupported => "ESYNC",
      Self::Io(e) => match e.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::PermissionDenied => "EACCES",
        _ => "EIO",
      },
    }
  }
}

//
// CompromisedReason
//

/// How the refresher discovered that the lock is no longer ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompromisedReason {
  /// The sentinel disappeared: somebody removed it, or reclaimed it and released since.
  SentinelMissing,
  /// The sentinel exists but its mtime is not the one we last wrote: another party owns it now.
  MtimeDrift,
  /// Too much time passed since our last successful refresh; any contender is entitled to treat
  /// the sentinel as stale, so we must stop acting as the holder.
  StaleThreshold,
}

impl std::fmt::Display for CompromisedReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::SentinelMissing => write!(f, "the lock sentinel was not found on disk"),
      Self::MtimeDrift => write!(
        f,
        "the sentinel mtime is no longer ours; the lock could not be kept within the stale \
         threshold"
      ),
      Self::StaleThreshold => {
        write!(f, "the lock could not be refreshed within the stale threshold")
      },
    }
  }
}

//
// OnCompromised
//

/// Receives the compromise notification for a held lock. Invoked from the refresher task, after
/// the lock's registry entry is already gone; the holder must stop acting as owner.
pub trait OnCompromised: Send + Sync {
  fn on_compromised(&self, error: Error);
}

// Unless the host installs a handler, losing a lock is unrecoverable: panic rather than let the
// holder keep mutating state it no longer owns.
struct PanicOnCompromise;

impl OnCompromised for PanicOnCompromise {
  fn on_compromised(&self, error: Error) {
    panic!("lock was compromised and no compromise handler is installed: {error}");
  }
}

//
// LockOptions
//

#[derive(Clone)]
pub struct LockOptions {
  /// How long an unrefreshed sentinel stays valid. `None` disables staleness handling entirely:
  /// existing sentinels are never reclaimed and the refresher is not started. Values are
  /// clamped to at least 2 seconds; anything lower makes losing the lock to a slow filesystem
  /// more likely than keeping it.
  pub stale: Option<Duration>,

  /// How often the holder rewrites the sentinel's mtime. Defaults to half the stale threshold;
  /// explicit values are clamped into `[1s, stale / 2]`. An explicit zero disables refreshing.
  pub update: Option<Duration>,

  /// Retry policy for contended acquisition.
  pub retries: RetryPolicy,

  /// Resolve the target to its real path before locking, so that symlinked aliases of one file
  /// compete for the same sentinel. Requires the target to exist; disable it to lock
  /// conceptual names with no backing file.
  pub realpath: bool,

  /// Put the sentinel somewhere other than `<target>.lock`.
  pub lockfile_path: Option<PathBuf>,

  pub fs: Arc<dyn FileSystem>,
  pub time: Arc<dyn TimeProvider>,

  /// Invoked when the refresher discovers the lock is no longer ours. The default panics.
  pub on_compromised: Arc<dyn OnCompromised>,
}

impl Default for LockOptions {
  fn default() -> Self {
    Self {
      stale: Some(DEFAULT_STALE),
      update: None,
      retries: RetryPolicy::default(),
      realpath: true,
      lockfile_path: None,
      fs: Arc::new(RealFileSystem),
      time: Arc::new(SystemTimeProvider),
      on_compromised: Arc::new(PanicOnCompromise),
    }
  }
}

//
// UnlockOptions
//

#[derive(Clone)]
pub struct UnlockOptions {
  /// Must match the `realpath` the lock was acquired with, or the canonical keys will not line
  /// up.
  pub realpath: bool,
  pub fs: Arc<dyn FileSystem>,
}

impl Default for UnlockOptions {
  fn default() -> Self {
    Self {
      realpath: true,
      fs: Arc::new(RealFileSystem),
    }
  }
}

//
// CheckOptions
//

#[derive(Clone)]
pub struct CheckOptions {
  /// Same meaning and clamp as [`LockOptions::stale`]. A stale sentinel reports unlocked, for
  /// symmetry with what an acquisition attempt would conclude.
  pub stale: Option<Duration>,
  pub realpath: bool,
  pub lockfile_path: Option<PathBuf>,
  pub fs: Arc<dyn FileSystem>,
  pub time: Arc<dyn TimeProvider>,
}

impl Default for CheckOptions {
  fn default() -> Self {
    Self {
      stale: Some(DEFAULT_STALE),
      realpath: true,
      lockfile_path: None,
      fs: Arc::new(RealFileSystem),
      time: Arc::new(SystemTimeProvider),
    }
  }
}

//
// Timings
//

/// The effective staleness configuration after defaults and clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timings {
  /// `None` = staleness handling disabled.
  pub stale_ms: Option<i64>,
  /// `0` = refreshing disabled.
  pub update_ms: i64,
}

impl Timings {
  pub(crate) fn normalize(stale: Option<Duration>, update: Option<Duration>) -> Self {
    let stale_ms = stale.map(|stale| ms_of(stale).max(STALE_FLOOR_MS));
    let update_ms = match (stale_ms, update) {
      // Without a stale threshold the mtime beacon serves no purpose; nothing reads it.
      (None, _) => 0,
      (Some(_), Some(update)) if update.is_zero() => 0,
      (Some(stale_ms), None) => stale_ms / 2,
      (Some(stale_ms), Some(update)) => ms_of(update).clamp(UPDATE_FLOOR_MS, stale_ms / 2),
    };

    Self {
      stale_ms,
      update_ms,
    }
  }
}

fn ms_of(duration: Duration) -> i64 {
  i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

//
// Public operations
//

/// Acquire an advisory lock on `target`.
///
/// Returns a [`LockGuard`] which releases the lock when explicitly asked to or when dropped.
/// While the guard is live, a background task refreshes the sentinel's mtime every
/// `update` interval and reports through `on_compromised` if the lock demonstrably stops being
/// ours.
///
/// A held, non-stale lock fails with [`Error::Locked`]; configure [`LockOptions::retries`] to
/// wait for the holder instead.
pub async fn lock(target: impl AsRef<Path>, options: LockOptions) -> Result<LockGuard> {
  let LockOptions {
    stale,
    update,
    retries,
    realpath,
    lockfile_path,
    fs,
    time,
    on_compromised,
  } = options;

  let key = path::resolve(fs.as_ref(), target.as_ref(), realpath).await?;
  let sentinel = path::sentinel_path(&key, lockfile_path.as_deref());
  let timings = Timings::normalize(stale, update);

  // Holding a second lock on the same key within one process is a caller bug, and one we can
  // report before disturbing the filesystem.
  if registry::is_held(&key) {
    return Err(Error::Locked(sentinel));
  }

  let acquired = retry::with_retries(&retries, || {
    acquire::try_acquire(fs.as_ref(), time.as_ref(), &sentinel, timings.stale_ms)
  })
  .await?;

  registry::register(key, sentinel, acquired, timings, fs, time, on_compromised)
}

/// Release the lock on `target` by path, without going through its [`LockGuard`]. Fails with
/// [`Error::NotAcquired`] when this process does not hold the lock.
pub async fn unlock(target: impl AsRef<Path>, options: UnlockOptions) -> Result<()> {
  let UnlockOptions { realpath, fs } = options;

  let key = path::resolve(fs.as_ref(), target.as_ref(), realpath).await?;
  registry::unlock(&key).await
}

/// Whether `target` currently appears locked by somebody. Both a missing and a stale sentinel
/// report `false`.
pub async fn check(target: impl AsRef<Path>, options: CheckOptions) -> Result<bool> {
  let CheckOptions {
    stale,
    realpath,
    lockfile_path,
    fs,
    time,
  } = options;

  let key = path::resolve(fs.as_ref(), target.as_ref(), realpath).await?;
  let sentinel = path::sentinel_path(&key, lockfile_path.as_deref());
  let timings = Timings::normalize(stale, None);

  acquire::check(fs.as_ref(), time.as_ref(), &sentinel, timings.stale_ms).await
}
