// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use async_trait::async_trait;
use parking_lot::Mutex;
use pathlock_time::{from_unix_timestamp_ms, OffsetDateTimeExt, TimeProvider};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;

/// Identifies the filesystem/device a path lives on. Mtime precision is a property of the device,
/// not of individual paths.
pub type DeviceId = u64;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  pathlock_test_helpers::test_global_init();
}

//
// Metadata
//

/// The subset of stat output the locking protocol consumes.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
  pub mtime: OffsetDateTime,
  pub device: DeviceId,
}

//
// FileSystem
//

/// The filesystem surface used by the locking protocol. Callers may inject an alternative
/// implementation to lock over a virtual or instrumented filesystem; this is the only I/O
/// surface the protocol touches.
///
/// `create_dir` is the primitive correctness rests on: it must either create the directory or
/// fail with `ErrorKind::AlreadyExists`, atomically with respect to every other participant on
/// the shared filesystem.
#[async_trait]
pub trait FileSystem: Send + Sync {
  /// Atomically create an empty directory, failing with `ErrorKind::AlreadyExists` if anything
  /// is already present at `path`.
  async fn create_dir(&self, path: &Path) -> io::Result<()>;

  /// Removes the directory if it exists.
  async fn remove_dir(&self, path: &Path) -> io::Result<()>;

  async fn metadata(&self, path: &Path) -> io::Result<Metadata>;

  /// Set both the access and modification time of `path` to `to`.
  async fn set_times(&self, path: &Path, to: OffsetDateTime) -> io::Result<()>;

  async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

  /// Blocking mirror of `remove_dir`, for cleanup paths that run outside any runtime (drop
  /// handlers, exit sweeps).
  fn remove_dir_blocking(&self, path: &Path) -> io::Result<()>;
}

#[cfg(unix)]
fn device_of(metadata: &std::fs::Metadata) -> DeviceId {
  use std::os::unix::fs::MetadataExt;
  metadata.dev()
}

// Windows has no cheap device identity on a stat; collapse everything onto one pseudo-device.
#[cfg(not(unix))]
fn device_of(_metadata: &std::fs::Metadata) -> DeviceId {
  0
}

//
// RealFileSystem
//

/// The real filesystem implementation which delegates to `tokio::fs`. Paths are used as given;
/// the protocol always works with absolute, resolved paths.
pub struct RealFileSystem;

#[async_trait]
impl FileSystem for RealFileSystem {
  async fn create_dir(&self, path: &Path) -> io::Result<()> {
    tokio::fs::create_dir(path).await
  }

  async fn remove_dir(&self, path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir(path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }

  async fn metadata(&self, path: &Path) -> io::Result<Metadata> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(Metadata {
      mtime: metadata.modified()?.into(),
      device: device_of(&metadata),
    })
  }

  async fn set_times(&self, path: &Path, to: OffsetDateTime) -> io::Result<()> {
    // Neither std nor tokio can set times on a directory portably; filetime can.
    let path = path.to_path_buf();
    let times = filetime::FileTime::from_unix_time(to.unix_timestamp(), to.nanosecond());
    tokio::task::spawn_blocking(move || filetime::set_file_times(&path, times, times))
      .await
      .map_err(io::Error::other)?
  }

  async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
    tokio::fs::canonicalize(path).await
  }

  fn remove_dir_blocking(&self, path: &Path) -> io::Result<()> {
    match std::fs::remove_dir(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }
}

//
// TestFileSystem
//

static NEXT_TEST_DEVICE: AtomicU64 = AtomicU64::new(1 << 32);

/// An in-memory test implementation of a file system, meant to somewhat mimic the behavior of a
/// real filesystem. Every instance reports a unique device id so that per-device state built on
/// top of it never leaks between tests.
///
/// Entries carry only an mtime; the file/directory distinction is not modeled.
pub struct TestFileSystem {
  time: Arc<dyn TimeProvider>,
  device: DeviceId,
  entries: Mutex<HashMap<PathBuf, OffsetDateTime>>,

  /// When set, stored mtimes are truncated to whole seconds, mimicking filesystems that do not
  /// record sub-second timestamps.
  pub whole_second_mtimes: AtomicBool,

  /// When set, `set_times` fails with an injected error.
  pub fail_set_times: AtomicBool,

  set_times_calls: AtomicUsize,
}

impl TestFileSystem {
  #[must_use]
  pub fn new(time: Arc<dyn TimeProvider>) -> Self {
    Self {
      time,
      device: NEXT_TEST_DEVICE.fetch_add(1, Ordering::Relaxed),
      entries: Mutex::new(HashMap::new()),
      whole_second_mtimes: AtomicBool::new(false),
      fail_set_times: AtomicBool::new(false),
      set_times_calls: AtomicUsize::new(0),
    }
  }

  /// Create an entry at `path`, stamped with the current time. Used to stand in for the lock
  /// target itself.
  pub fn touch(&self, path: impl Into<PathBuf>) {
    let now = self.store_time(self.time.now());
    self.entries.lock().insert(path.into(), now);
  }

  /// Overwrite an entry's mtime directly, bypassing truncation. This is the "another party ran
  /// utimes on our sentinel" test hook.
  pub fn force_mtime(&self, path: &Path, mtime: OffsetDateTime) {
    self.entries.lock().insert(path.to_path_buf(), mtime);
  }

  /// Remove an entry out from under the protocol.
  pub fn remove(&self, path: &Path) {
    self.entries.lock().remove(path);
  }

  #[must_use]
  pub fn exists(&self, path: &Path) -> bool {
    self.entries.lock().contains_key(path)
  }

  #[must_use]
  pub fn mtime_of(&self, path: &Path) -> Option<OffsetDateTime> {
    self.entries.lock().get(path).copied()
  }

  /// How many `set_times` calls reached this filesystem, including failed ones.
  #[must_use]
  pub fn set_times_calls(&self) -> usize {
    self.set_times_calls.load(Ordering::Relaxed)
  }

  fn store_time(&self, t: OffsetDateTime) -> OffsetDateTime {
    if self.whole_second_mtimes.load(Ordering::Relaxed) {
      from_unix_timestamp_ms(t.unix_timestamp_ms().div_euclid(1_000) * 1_000)
    } else {
      t
    }
  }
}

#[async_trait]
impl FileSystem for TestFileSystem {
  async fn create_dir(&self, path: &Path) -> io::Result<()> {
    let now = self.store_time(self.time.now());
    let mut entries = self.entries.lock();
    if entries.contains_key(path) {
      return Err(io::ErrorKind::AlreadyExists.into());
    }
    entries.insert(path.to_path_buf(), now);
    Ok(())
  }

  async fn remove_dir(&self, path: &Path) -> io::Result<()> {
    self.entries.lock().remove(path);
    Ok(())
  }

  async fn metadata(&self, path: &Path) -> io::Result<Metadata> {
    self.entries.lock().get(path).map_or_else(
      || Err(io::ErrorKind::NotFound.into()),
      |mtime| {
        Ok(Metadata {
          mtime: *mtime,
          device: self.device,
        })
      },
    )
  }

  async fn set_times(&self, path: &Path, to: OffsetDateTime) -> io::Result<()> {
    self.set_times_calls.fetch_add(1, Ordering::Relaxed);

    if self.fail_set_times.load(Ordering::Relaxed) {
      return Err(io::Error::other("injected set_times failure"));
    }

    let stored = self.store_time(to);
    let mut entries = self.entries.lock();
    match entries.get_mut(path) {
      Some(mtime) => {
        *mtime = stored;
        Ok(())
      },
      None => Err(io::ErrorKind::NotFound.into()),
    }
  }

  // Paths are stored as given, so canonicalization only checks existence. Tests pass absolute,
  // already-normal paths.
  async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
    if self.entries.lock().contains_key(path) {
      Ok(path.to_path_buf())
    } else {
      Err(io::ErrorKind::NotFound.into())
    }
  }

  fn remove_dir_blocking(&self, path: &Path) -> io::Result<()> {
    self.entries.lock().remove(path);
    Ok(())
  }
}
