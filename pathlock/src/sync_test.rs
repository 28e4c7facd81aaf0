// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::RetryPolicy;
use pretty_assertions::assert_eq;

#[test]
fn blocking_surface_round_trips() {
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("resource");
  std::fs::write(&target, b"contents").unwrap();

  let mut guard = lock_blocking(&target, LockOptions::default()).unwrap();
  assert!(guard.sentinel().exists());
  assert!(check_blocking(&target, CheckOptions::default()).unwrap());

  release_blocking(&mut guard).unwrap();
  assert!(!guard.sentinel().exists());
  assert!(!check_blocking(&target, CheckOptions::default()).unwrap());
}

#[test]
fn blocking_unlock_by_path() {
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("resource");
  std::fs::write(&target, b"contents").unwrap();

  let guard = lock_blocking(&target, LockOptions::default()).unwrap();
  unlock_blocking(&target, UnlockOptions::default()).unwrap();
  assert!(!guard.sentinel().exists());
  drop(guard);
}

#[test]
fn blocking_lock_rejects_retries() {
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("resource");
  std::fs::write(&target, b"contents").unwrap();

  let options = LockOptions {
    retries: RetryPolicy::from(3),
    ..LockOptions::default()
  };
  let err = lock_blocking(&target, options).unwrap_err();
  assert!(matches!(err, Error::SyncRetriesUnsupported), "{err:?}");
  assert_eq!(err.code(), "ESYNC");
  // Rejected before touching the filesystem.
  assert!(!dir.path().join("resource.lock").exists());
}

#[test]
fn blocking_unlock_of_unheld_lock_fails() {
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().join("resource");
  std::fs::write(&target, b"contents").unwrap();

  let err = unlock_blocking(&target, UnlockOptions::default()).unwrap_err();
  assert!(matches!(err, Error::NotAcquired(_)), "{err:?}");
}
