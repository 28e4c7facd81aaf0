// pathlock - advisory file locking for shared filesystems
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./path_test.rs"]
mod path_test;

use pathlock_fs::FileSystem;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolve a lock target to its canonical key.
///
/// With `realpath` the target must exist: symlinked aliases of one file collapse onto a single
/// key and therefore compete for the same sentinel. Without it the path is only normalized
/// lexically, which allows locking names that have no backing file.
pub(crate) async fn resolve(
  fs: &dyn FileSystem,
  target: &Path,
  realpath: bool,
) -> io::Result<PathBuf> {
  if realpath {
    fs.canonicalize(target).await
  } else {
    normalize(target)
  }
}

/// Lexical normalization: make absolute against the current directory and resolve `.`/`..`
/// components without touching the filesystem.
fn normalize(path: &Path) -> io::Result<PathBuf> {
  let absolute = if path.is_absolute() {
    path.to_path_buf()
  } else {
    std::env::current_dir()?.join(path)
  };

  let mut normalized = PathBuf::new();
  for component in absolute.components() {
    match component {
      Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
      Component::RootDir => normalized.push(component.as_os_str()),
      Component::CurDir => {},
      Component::ParentDir => {
        normalized.pop();
      },
      Component::Normal(part) => normalized.push(part),
    }
  }

  Ok(normalized)
}

/// The sentinel path for a canonical key: the override verbatim when one was supplied, else the
/// key with `.lock` appended. Appending (rather than replacing an extension) keeps
/// `dir/dir.lock` distinct from a sibling `dir.lock` target.
#[must_use]
pub(crate) fn sentinel_path(key: &Path, override_path: Option<&Path>) -> PathBuf {
  override_path.map_or_else(
    || {
      let mut sentinel = key.as_os_str().to_os_string();
      sentinel.push(".lock");
      PathBuf::from(sentinel)
    },
    Path::to_path_buf,
  )
}
