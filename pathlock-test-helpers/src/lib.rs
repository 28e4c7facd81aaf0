// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use tracing_subscriber::EnvFilter;

/// Install the test logging subscriber. Crates call this from a `#[ctor::ctor]` so that every
/// test binary gets `log` output routed through tracing with `RUST_LOG` filtering; repeat calls
/// (one per linked crate) are no-ops.
pub fn test_global_init() {
  let filter = EnvFilter::new(std::env::var("RUST_LOG").as_deref().unwrap_or("debug"));

  let _ = tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(filter)
    .with_line_number(true)
    .compact()
    .try_init();
}
