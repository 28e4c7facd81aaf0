// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::registry;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Wait for SIGTERM or SIGINT, then release every lock held by this process. Hosts that want
/// cooperative cleanup on termination spawn this alongside their other shutdown listeners; a
/// holder that dies without it merely leaves a sentinel for the stale pathway to reclaim.
#[cfg(unix)]
pub async fn release_on_shutdown() {
  let mut sigterm_stream = signal(SignalKind::terminate()).unwrap();
  let mut sigint_stream = signal(SignalKind::interrupt()).unwrap();
  tokio::select! {
    _ = sigterm_stream.recv() => {},
    _ = sigint_stream.recv() => {},
  }

  log::info!("received SIGTERM or SIGINT, releasing held locks");
  registry::release_all().await;
}

#[cfg(windows)]
pub async fn release_on_shutdown() {
  // Windows doesn't have signals, so we wait for CTRL-C.
  tokio::signal::ctrl_c().await.unwrap();
  log::info!("received CTRL-C, releasing held locks");
  registry::release_all().await;
}
