// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

// End-to-end runs of the locking protocol against a real filesystem. Timing-sensitive laws are
// covered with the virtual clock in the registry tests; these use real (short) stale/update
// intervals and real sleeps.

use super::*;
use parking_lot::Mutex;
use pathlock_fs::FileSystem;
use pretty_assertions::assert_eq;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;

struct RecordingHandler {
  tx: Mutex<Option<oneshot::Sender<Error>>>,
}

impl RecordingHandler {
  fn new() -> (Arc<Self>, oneshot::Receiver<Error>) {
    let (tx, rx) = oneshot::channel();
    (
      Arc::new(Self {
        tx: Mutex::new(Some(tx)),
      }),
      rx,
    )
  }
}

impl OnCompromised for RecordingHandler {
  fn on_compromised(&self, error: Error) {
    if let Some(tx) = self.tx.lock().take() {
      let _ = tx.send(error);
    }
  }
}

fn target_in(dir: &tempfile::TempDir) -> PathBuf {
  let target = dir.path().join("resource");
  std::fs::write(&target, b"contents").unwrap();
  target
}

#[tokio::test]
async fn lock_check_release_round_trip() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);
  let sentinel = dir.path().join("resource.lock");

  let options = LockOptions {
    stale: Some(Duration::from_secs(10)),
    update: Some(Duration::from_secs(5)),
    ..LockOptions::default()
  };
  let mut guard = lock(&target, options).await.unwrap();
  assert!(sentinel.is_dir());
  assert!(check(&target, CheckOptions::default()).await.unwrap());

  guard.release().await.unwrap();
  assert!(!sentinel.exists());
  assert!(!check(&target, CheckOptions::default()).await.unwrap());
}

#[tokio::test]
async fn reclaims_a_sentinel_abandoned_long_ago() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);
  let sentinel = dir.path().join("resource.lock");

  // Another process crashed a minute ago.
  std::fs::create_dir(&sentinel).unwrap();
  RealFileSystem
    .set_times(&sentinel, OffsetDateTime::now_utc() - time::Duration::seconds(60))
    .await
    .unwrap();

  let mut guard = lock(&target, LockOptions::default()).await.unwrap();

  let mtime = RealFileSystem.metadata(&sentinel).await.unwrap().mtime;
  assert!(OffsetDateTime::now_utc() - mtime < time::Duration::seconds(3));

  guard.release().await.unwrap();
}

#[tokio::test]
async fn disabled_staleness_respects_any_existing_sentinel() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);
  let sentinel = dir.path().join("resource.lock");

  std::fs::create_dir(&sentinel).unwrap();
  RealFileSystem
    .set_times(&sentinel, OffsetDateTime::now_utc() - time::Duration::seconds(60))
    .await
    .unwrap();

  let options = LockOptions {
    stale: None,
    ..LockOptions::default()
  };
  let err = lock(&target, options).await.unwrap_err();
  assert_eq!(err.code(), "ELOCKED");
}

#[tokio::test]
async fn concurrent_contenders_get_exactly_one_lock() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);

  let (a, b) = tokio::join!(
    lock(&target, LockOptions::default()),
    lock(&target, LockOptions::default()),
  );

  let (mut winner, loser) = match (a, b) {
    (Ok(guard), Err(e)) | (Err(e), Ok(guard)) => (guard, e),
    (Ok(_), Ok(_)) => panic!("both contenders acquired the lock"),
    (Err(a), Err(b)) => panic!("neither contender acquired the lock: {a}, {b}"),
  };
  assert_eq!(loser.code(), "ELOCKED");

  winner.release().await.unwrap();
}

#[tokio::test]
async fn a_waiting_contender_wins_after_release() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);

  let mut guard = lock(&target, LockOptions::default()).await.unwrap();

  let contender = {
    let target = target.clone();
    tokio::spawn(async move {
      let options = LockOptions {
        retries: RetryPolicy {
          retries: 10,
          min_timeout: Duration::from_millis(100),
          max_timeout: Duration::from_millis(500),
          factor: 2.0,
        },
        ..LockOptions::default()
      };
      lock(&target, options).await
    })
  };

  tokio::time::sleep(Duration::from_millis(300)).await;
  guard.release().await.unwrap();

  let mut won = contender.await.unwrap().unwrap();
  won.release().await.unwrap();
}

#[tokio::test]
async fn refreshes_then_compromises_when_the_sentinel_is_removed() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);
  let sentinel = dir.path().join("resource.lock");
  let (handler, rx) = RecordingHandler::new();

  let options = LockOptions {
    stale: Some(Duration::from_secs(2)),
    update: Some(Duration::from_secs(1)),
    on_compromised: handler,
    ..LockOptions::default()
  };
  let guard = lock(&target, options).await.unwrap();

  let initial = RealFileSystem.metadata(&sentinel).await.unwrap().mtime;
  tokio::time::sleep(Duration::from_millis(2_500)).await;
  let refreshed = RealFileSystem.metadata(&sentinel).await.unwrap().mtime;
  // The acquisition probe stamps up to a second ahead of the wall clock, so two refresh cycles
  // net out to roughly one second of forward movement.
  assert!(
    refreshed - initial >= time::Duration::milliseconds(900),
    "expected the refresher to advance the mtime, got {initial} -> {refreshed}"
  );

  std::fs::remove_dir(&sentinel).unwrap();

  let error = tokio::time::timeout(Duration::from_secs(2), rx)
    .await
    .expect("compromise did not fire in time")
    .unwrap();
  assert_eq!(error.code(), "ECOMPROMISED");
  assert!(error.to_string().contains("not found"), "{error}");

  drop(guard);
  assert!(!held().contains(&tokio::fs::canonicalize(&target).await.unwrap()));
}

#[tokio::test]
async fn compromises_when_another_party_rewrites_the_mtime() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);
  let sentinel = dir.path().join("resource.lock");
  let (handler, rx) = RecordingHandler::new();

  let options = LockOptions {
    stale: Some(Duration::from_secs(2)),
    update: Some(Duration::from_secs(1)),
    on_compromised: handler,
    ..LockOptions::default()
  };
  let _guard = lock(&target, options).await.unwrap();

  RealFileSystem
    .set_times(&sentinel, OffsetDateTime::now_utc() - time::Duration::seconds(60))
    .await
    .unwrap();

  let error = tokio::time::timeout(Duration::from_secs(3), rx)
    .await
    .expect("compromise did not fire in time")
    .unwrap();
  assert!(error.to_string().contains("stale threshold"), "{error}");
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_aliases_compete_for_one_sentinel() {
  let dir = tempfile::tempdir().unwrap();
  let target = target_in(&dir);
  let alias = dir.path().join("alias");
  std::os::unix::fs::symlink(&target, &alias).unwrap();

  let mut guard = lock(&alias, LockOptions::default()).await.unwrap();

  let err = lock(&target, LockOptions::default()).await.unwrap_err();
  assert_eq!(err.code(), "ELOCKED");

  guard.release().await.unwrap();
}
