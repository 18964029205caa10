//! Snapshot builders.
//!
//! Two variants produce the same file. The fork variant isolates the save
//! in a child process whose writes stream back through a pipe, so the
//! automaton keeps serving while the kernel copy-on-writes the state. The
//! no-fork variant exists for platforms and instrumentations where forking
//! is off the table: the save runs synchronously into an in-memory
//! switchable output which is then drained asynchronously into the writer.

use crate::error::{KeelError, Result};
use crate::snapshot::store::{SnapshotParams, SnapshotWriter};
use std::io::Write;
use std::time::Duration;

/// Sync-phase sink for the no-fork builder. The save routine must not
/// suspend while writing here; once it returns, the buffered chunks are
/// forwarded in order.
pub struct SwitchableOutput {
  chunks: Vec<Vec<u8>>,
  bytes: u64,
}

impl SwitchableOutput {
  pub fn new() -> Self {
    Self {
      chunks: Vec::new(),
      bytes: 0,
    }
  }

  pub fn bytes_buffered(&self) -> u64 {
    self.bytes
  }

  /// Resumes in async mode: forwards every buffered chunk into the writer
  /// on a blocking thread, then finishes the writer.
  pub async fn drain_into(self, mut writer: Box<dyn SnapshotWriter>) -> Result<SnapshotParams> {
    tokio::task::spawn_blocking(move || {
      for chunk in self.chunks {
        writer.write_all(&chunk)?;
      }
      writer.finish()
    })
    .await
    .map_err(|error| KeelError::Snapshot(format!("snapshot drain task failed: {error}")))?
  }
}

impl Default for SwitchableOutput {
  fn default() -> Self {
    Self::new()
  }
}

impl Write for SwitchableOutput {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.bytes += buf.len() as u64;
    self.chunks.push(buf.to_vec());
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

/// No-fork build, sync phase: runs the save routine against a switchable
/// output. The caller drains the returned output asynchronously.
pub fn capture_no_fork(
  save: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<SwitchableOutput> {
  let mut output = SwitchableOutput::new();
  save(&mut output)?;
  tracing::debug!(bytes = output.bytes_buffered(), "snapshot captured in memory");
  Ok(output)
}

/// A forked snapshot save: the child is writing the state into the pipe.
#[cfg(unix)]
pub struct ForkedSave {
  child: nix::unistd::Pid,
  pipe: std::fs::File,
}

/// Fork phase of the fork builder. Cheap; runs on the automaton context so
/// the child sees a consistent state. The heavy transfer happens in
/// [`ForkedSave::transfer_into`].
#[cfg(unix)]
pub fn fork_save(save: impl FnOnce(&mut dyn Write) -> Result<()>) -> Result<ForkedSave> {
  use nix::unistd::{fork, ForkResult};
  use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};

  let (read_fd, write_fd): (OwnedFd, OwnedFd) =
    nix::unistd::pipe().map_err(|error| KeelError::Snapshot(format!("pipe: {error}")))?;

  match unsafe { fork() } {
    Ok(ForkResult::Child) => {
      // Child: only the pipe write end and stderr stay interesting.
      drop(read_fd);
      let mut pipe = unsafe { std::fs::File::from_raw_fd(write_fd.into_raw_fd()) };
      let code = match save(&mut pipe) {
        Ok(()) => {
          let _ = pipe.flush();
          0
        }
        Err(error) => {
          eprintln!("snapshot save failed in child: {error}");
          1
        }
      };
      drop(pipe);
      unsafe { libc::_exit(code) };
    }
    Ok(ForkResult::Parent { child }) => {
      drop(write_fd);
      let pipe = unsafe { std::fs::File::from_raw_fd(read_fd.into_raw_fd()) };
      Ok(ForkedSave { child, pipe })
    }
    Err(error) => Err(KeelError::Snapshot(format!("fork: {error}"))),
  }
}

#[cfg(unix)]
impl ForkedSave {
  /// Pumps the pipe into the snapshot writer and enforces the fork
  /// timeout. Blocking; run from a blocking thread.
  pub fn transfer_into(
    self,
    writer: Box<dyn SnapshotWriter>,
    fork_timeout: Duration,
  ) -> Result<SnapshotParams> {
    build_transfer(self.child, self.pipe, writer, fork_timeout)
  }
}

/// Convenience wrapper: fork, transfer and finish in one blocking call.
#[cfg(unix)]
pub fn build_forked(
  save: impl FnOnce(&mut dyn Write) -> Result<()>,
  writer: Box<dyn SnapshotWriter>,
  fork_timeout: Duration,
) -> Result<SnapshotParams> {
  fork_save(save)?.transfer_into(writer, fork_timeout)
}

#[cfg(unix)]
fn build_transfer(
  child: nix::unistd::Pid,
  mut pipe: std::fs::File,
  mut writer: Box<dyn SnapshotWriter>,
  fork_timeout: Duration,
) -> Result<SnapshotParams> {
  use nix::sys::signal::{kill, Signal};
  use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
  use std::io::Read;
  use std::time::Instant;

  // Transfer loop on its own thread: pump the pipe into the writer until
  // the child closes its end.
  let transfer = std::thread::Builder::new()
    .name("snapshot-transfer".to_string())
    .spawn(move || -> Result<Box<dyn SnapshotWriter>> {
      let mut buffer = vec![0u8; 1 << 20];
      loop {
        match pipe.read(&mut buffer) {
          Ok(0) => return Ok(writer),
          Ok(read) => writer.write_all(&buffer[..read])?,
          Err(error) => return Err(KeelError::Io(error)),
        }
      }
    })
    .map_err(|error| KeelError::Snapshot(format!("spawn transfer thread: {error}")))?;

  // Watchdog: the child must exit within the fork timeout. Killing it
  // closes the pipe, which unblocks the transfer thread.
  let started = Instant::now();
  let wait_result = loop {
    match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
      Ok(WaitStatus::StillAlive) => {
        if started.elapsed() > fork_timeout {
          tracing::error!(?child, "snapshot child exceeded fork timeout, killing");
          let _ = kill(child, Signal::SIGKILL);
          let _ = waitpid(child, None);
          break Err(KeelError::Snapshot(
            "snapshot child exceeded fork timeout".to_string(),
          ));
        }
        std::thread::sleep(Duration::from_millis(50));
      }
      Ok(WaitStatus::Exited(_, 0)) => break Ok(()),
      Ok(WaitStatus::Exited(_, code)) => {
        break Err(KeelError::Snapshot(format!(
          "snapshot child exited with code {code}"
        )))
      }
      Ok(status) => {
        break Err(KeelError::Snapshot(format!(
          "snapshot child ended abnormally: {status:?}"
        )))
      }
      Err(error) => break Err(KeelError::Snapshot(format!("waitpid: {error}"))),
    }
  };

  let writer = transfer
    .join()
    .map_err(|_| KeelError::Snapshot("snapshot transfer thread panicked".to_string()))??;
  wait_result?;
  writer.finish()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{SnapshotCodec, SnapshotConfig};
  use crate::snapshot::format::SnapshotMeta;
  use crate::snapshot::store::{FileSnapshotStore, SnapshotStore};
  use std::io::Read;
  use tempfile::tempdir;

  fn test_store(dir: &std::path::Path) -> std::sync::Arc<FileSnapshotStore> {
    FileSnapshotStore::open_store(
      dir,
      SnapshotConfig {
        codec: SnapshotCodec::Zstd,
        max_snapshot_count_to_keep: 3,
      },
    )
    .expect("store")
  }

  #[tokio::test]
  async fn no_fork_build_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let store = test_store(dir.path());
    let body = vec![42u8; 1 << 16];

    let output = capture_no_fork(|out| {
      out.write_all(&body)?;
      Ok(())
    })
    .expect("capture");
    let writer = store
      .open_writer(1, SnapshotMeta::default())
      .expect("writer");
    let params = output.drain_into(writer).await.expect("drain");
    assert_eq!(params.uncompressed_length, body.len() as u64);

    let mut reader = store.open_reader(1).expect("reader");
    let mut back = Vec::new();
    reader.read_to_end(&mut back).expect("read");
    assert_eq!(back, body);
  }

  #[cfg(unix)]
  #[test]
  fn forked_build_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let store = test_store(dir.path());
    let body: Vec<u8> = (0..(1u32 << 16)).map(|value| value as u8).collect();

    let writer = store
      .open_writer(2, SnapshotMeta::default())
      .expect("writer");
    let body_clone = body.clone();
    let params = build_forked(
      move |out| {
        out.write_all(&body_clone)?;
        Ok(())
      },
      writer,
      Duration::from_secs(30),
    )
    .expect("build");
    assert_eq!(params.uncompressed_length, body.len() as u64);

    let mut reader = store.open_reader(2).expect("reader");
    let mut back = Vec::new();
    reader.read_to_end(&mut back).expect("read");
    assert_eq!(back, body);
  }
}
