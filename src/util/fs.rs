//! Small filesystem helpers shared by the changelog and snapshot stores.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub const TMP_SUFFIX: &str = "tmp";

/// Durably replaces `path` with freshly written bytes: write to a sibling
/// tmp file, fsync, rename, fsync the parent directory.
pub fn replace_file_atomically(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
  let tmp_path = tmp_sibling(path);
  let mut file = OpenOptions::new()
    .create(true)
    .truncate(true)
    .write(true)
    .open(&tmp_path)?;
  file.write_all(bytes)?;
  if sync {
    file.sync_all()?;
  }
  drop(file);
  std::fs::rename(&tmp_path, path)?;
  if sync {
    sync_parent_dir(path.parent())?;
  }
  Ok(())
}

/// Sibling path with an extra `.tmp` extension appended (the original
/// extension is kept, so `000000001.snapshot` maps to
/// `000000001.snapshot.tmp`).
pub fn tmp_sibling(path: &Path) -> std::path::PathBuf {
  let mut name = path.as_os_str().to_os_string();
  name.push(".");
  name.push(TMP_SUFFIX);
  std::path::PathBuf::from(name)
}

pub fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      File::open(parent)?.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}

/// Removes stale `*.tmp` leftovers from interrupted create/rename cycles.
pub fn cleanup_tmp_files(dir: &Path) -> Result<()> {
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if path.extension().is_some_and(|ext| ext == TMP_SUFFIX) {
      tracing::warn!(path = %path.display(), "removing stale temporary file");
      std::fs::remove_file(&path)?;
    }
  }
  Ok(())
}
