// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./probe_test.rs"]
mod probe_test;

use parking_lot::Mutex;
use pathlock_fs::{DeviceId, FileSystem, Metadata};
use pathlock_time::{from_unix_timestamp_ms, OffsetDateTimeExt, TimeProvider};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::LazyLock;
use time::OffsetDateTime;

//
// MtimePrecision
//

/// Whether a device stores modification times at whole-second or millisecond resolution. The
/// refresher needs this to decide whether a sentinel's mtime still "belongs to us": comparing at
/// millisecond granularity is wrong on a truncating filesystem, and comparing at second
/// granularity throws away the signal on a preserving one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtimePrecision {
  Second,
  Millisecond,
}

static PRECISION_CACHE: LazyLock<Mutex<HashMap<DeviceId, MtimePrecision>>> =
  LazyLock::new(Mutex::default);

/// Stat a freshly acquired sentinel and report its mtime together with the device's mtime
/// precision. The first contact with a device performs one probing write; afterwards the cached
/// answer is used without I/O.
pub(crate) async fn probe(
  fs: &dyn FileSystem,
  time: &dyn TimeProvider,
  sentinel: &Path,
) -> io::Result<(OffsetDateTime, MtimePrecision)> {
  let Metadata { mtime, device } = fs.metadata(sentinel).await?;

  if let Some(precision) = PRECISION_CACHE.lock().get(&device).copied() {
    return Ok((mtime, precision));
  }

  // Write five milliseconds past the next second boundary and see whether the sub-second digits
  // survive a stat. Merely inspecting the creation mtime is not reliable: newly created inodes
  // can be clamped to whole seconds even on millisecond-capable filesystems.
  let now_ms = time.now().unix_timestamp_ms();
  let probe_ms = (now_ms + 999).div_euclid(1_000) * 1_000 + 5;
  fs.set_times(sentinel, from_unix_timestamp_ms(probe_ms)).await?;

  let observed = fs.metadata(sentinel).await?.mtime;
  let precision = if observed.unix_timestamp_ms() == probe_ms {
    MtimePrecision::Millisecond
  } else {
    MtimePrecision::Second
  };

  log::debug!("device {device} stores {precision:?} mtimes");
  PRECISION_CACHE.lock().insert(device, precision);

  Ok((observed, precision))
}

/// Compare two mtimes under a device's precision. On whole-second devices a write can land on
/// either side of a truncation boundary, so both the truncated and the rounded seconds are
/// accepted.
#[must_use]
pub(crate) fn mtimes_equal(
  a: OffsetDateTime,
  b: OffsetDateTime,
  precision: MtimePrecision,
) -> bool {
  let (a, b) = (a.unix_timestamp_ms(), b.unix_timestamp_ms());
  match precision {
    MtimePrecision::Millisecond => a == b,
    MtimePrecision::Second => {
      a.div_euclid(1_000) == b.div_euclid(1_000) || round_seconds(a) == round_seconds(b)
    },
  }
}

fn round_seconds(ms: i64) -> i64 {
  (ms + 500).div_euclid(1_000)
}
