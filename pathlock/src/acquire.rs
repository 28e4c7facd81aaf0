// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./acquire_test.rs"]
mod acquire_test;

use crate::probe::{probe, MtimePrecision};
use crate::{Error, Result};
use pathlock_fs::FileSystem;
use pathlock_time::{OffsetDateTimeExt, TimeProvider};
use std::io;
use std::path::Path;
use time::OffsetDateTime;

//
// Acquired
//

#[derive(Debug)]
pub(crate) struct Acquired {
  pub mtime: OffsetDateTime,
  pub precision: MtimePrecision,
}

/// One acquisition attempt: create the sentinel atomically, reclaiming a stale sentinel at most
/// once. Retrying repeated `Locked` outcomes is the caller's retry policy, not this function's.
pub(crate) async fn try_acquire(
  fs: &dyn FileSystem,
  time: &dyn TimeProvider,
  sentinel: &Path,
  stale_ms: Option<i64>,
) -> Result<Acquired> {
  // After one reclaim pass (or a sentinel that vanished mid-flight) the second create attempt
  // runs with staleness disabled, bounding the work per call even when another party is racing
  // removals against us.
  let mut reclaim_allowed = stale_ms.is_some();

  loop {
    match fs.create_dir(sentinel).await {
      Ok(()) => {
        let (mtime, precision) = probe(fs, time, sentinel).await?;
        log::debug!("acquired lock sentinel {}", sentinel.display());
        return Ok(Acquired { mtime, precision });
      },
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
        if !reclaim_allowed {
          return Err(Error::Locked(sentinel.to_path_buf()));
        }

        let metadata = match fs.metadata(sentinel).await {
          Ok(metadata) => metadata,
          Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // The holder released between our create and stat. Take the one extra create
            // attempt without staleness handling.
            reclaim_allowed = false;
            continue;
          },
          Err(e) => return Err(e.into()),
        };

        let stale_ms = stale_ms.unwrap_or(0);
        let now_ms = time.now().unix_timestamp_ms();
        let mtime_ms = metadata.mtime.unix_timestamp_ms();

        // Beyond the threshold in either direction counts as abandoned: too old means the
        // holder stopped refreshing, too far in the future means clock skew nobody will ever
        // refresh past. Moderate future drift stays held; the holder's own refresh will notice
        // the sentinel is not theirs.
        let is_stale = mtime_ms < now_ms - stale_ms || mtime_ms > now_ms + stale_ms;
        if !is_stale {
          return Err(Error::Locked(sentinel.to_path_buf()));
        }

        log::debug!("reclaiming stale lock sentinel {}", sentinel.display());
        fs.remove_dir(sentinel).await?;
        reclaim_allowed = false;
      },
      Err(e) => return Err(e.into()),
    }
  }
}

/// Whether the target currently appears locked: a missing sentinel and a stale sentinel both
/// report unlocked, mirroring what an acquisition attempt would conclude.
pub(crate) async fn check(
  fs: &dyn FileSystem,
  time: &dyn TimeProvider,
  sentinel: &Path,
  stale_ms: Option<i64>,
) -> Result<bool> {
  match fs.metadata(sentinel).await {
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
    Err(e) => Err(e.into()),
    Ok(metadata) => Ok(stale_ms.is_none_or(|stale_ms| {
      metadata.mtime.unix_timestamp_ms() >= time.now().unix_timestamp_ms() - stale_ms
    })),
  }
}
