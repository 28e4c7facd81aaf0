// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./sync_test.rs"]
mod sync_test;

use crate::registry::LockGuard;
use crate::{CheckOptions, Error, LockOptions, Result, UnlockOptions};
use std::path::Path;
use std::sync::LazyLock;
use tokio::runtime::Runtime;

// One worker thread is enough: it only hosts refresher tasks and the short-lived block_on
// bodies below.
static RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(1)
    .thread_name("pathlock-sync")
    .enable_all()
    .build()
    .expect("failed to build pathlock sync runtime")
});

/// Blocking variant of [`crate::lock`] for hosts without a runtime of their own. Refreshers for
/// locks acquired this way run on a small process-wide runtime.
///
/// Retries are rejected here: a blocking caller would sit inside this call for the entire
/// backoff schedule with no way to cancel it.
///
/// Must not be called from within an async context.
pub fn lock_blocking(target: impl AsRef<Path>, options: LockOptions) -> Result<LockGuard> {
  if options.retries.retries > 0 {
    return Err(Error::SyncRetriesUnsupported);
  }
  RUNTIME.block_on(crate::lock(target, options))
}

/// Blocking variant of [`crate::unlock`]. Must not be called from within an async context.
pub fn unlock_blocking(target: impl AsRef<Path>, options: UnlockOptions) -> Result<()> {
  RUNTIME.block_on(crate::unlock(target, options))
}

/// Blocking variant of [`crate::check`]. Must not be called from within an async context.
pub fn check_blocking(target: impl AsRef<Path>, options: CheckOptions) -> Result<bool> {
  RUNTIME.block_on(crate::check(target, options))
}

/// Blocking release handle companion: drives [`LockGuard::release`] on the sync runtime.
pub fn release_blocking(guard: &mut LockGuard) -> Result<()> {
  RUNTIME.block_on(guard.release())
}
