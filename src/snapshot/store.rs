//! Durable, numbered snapshot store.
//!
//! Files are `%09d.snapshot`. Writers stream into a tmp sibling and rename
//! on finish; readers verify the body checksum before exposing a
//! decompressing stream.

use crate::config::{SnapshotCodec, SnapshotConfig};
use crate::error::{KeelError, Result};
use crate::snapshot::format::{
  decode_snapshot_meta, encode_snapshot_meta, SnapshotHeader, SnapshotMeta,
  SNAPSHOT_HEADER_SIZE, SNAPSHOT_META_ALIGNMENT,
};
use crate::util::checksum::checksum;
use crate::util::fs::{sync_parent_dir, tmp_sibling};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SNAPSHOT_EXTENSION: &str = "snapshot";

/// Results of a finished snapshot write, reported back to the checkpointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotParams {
  pub checksum: u64,
  pub compressed_length: u64,
  pub uncompressed_length: u64,
}

pub trait SnapshotReader: Read + Send {
  fn snapshot_id(&self) -> u32;
  fn meta(&self) -> &SnapshotMeta;
}

pub trait SnapshotWriter: Write + Send {
  /// Flushes, back-patches the header and renames the file into place.
  fn finish(self: Box<Self>) -> Result<SnapshotParams>;
}

/// Capability set of a snapshot store backend.
pub trait SnapshotStore: Send + Sync {
  /// Latest snapshot id not exceeding `max_id`.
  fn latest_id(&self, max_id: u32) -> Result<Option<u32>>;
  fn snapshot_ids(&self) -> Result<Vec<u32>>;
  fn open_reader(&self, id: u32) -> Result<Box<dyn SnapshotReader>>;
  fn open_writer(&self, id: u32, meta: SnapshotMeta) -> Result<Box<dyn SnapshotWriter>>;
  fn remove(&self, id: u32) -> Result<()>;
  /// Raw file bytes from `offset`, bypassing header parsing. Used by the
  /// snapshot download path.
  fn read_raw(&self, id: u32, offset: u64, max_bytes: u64) -> Result<Vec<u8>>;
}

pub struct FileSnapshotStore {
  dir: PathBuf,
  config: SnapshotConfig,
}

impl FileSnapshotStore {
  pub fn open_store(dir: impl AsRef<Path>, config: SnapshotConfig) -> Result<Arc<Self>> {
    let dir = dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    crate::util::fs::cleanup_tmp_files(&dir)?;
    tracing::debug!(dir = %dir.display(), "snapshot store opened");
    Ok(Arc::new(Self { dir, config }))
  }

  pub fn snapshot_path(&self, id: u32) -> PathBuf {
    self.dir.join(format!("{id:09}.{SNAPSHOT_EXTENSION}"))
  }
}

impl SnapshotStore for FileSnapshotStore {
  fn latest_id(&self, max_id: u32) -> Result<Option<u32>> {
    Ok(
      self
        .snapshot_ids()?
        .into_iter()
        .filter(|id| *id <= max_id)
        .last(),
    )
  }

  fn snapshot_ids(&self) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&self.dir)? {
      let entry = entry?;
      let path = entry.path();
      if path
        .extension()
        .is_some_and(|extension| extension == SNAPSHOT_EXTENSION)
      {
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
          if let Ok(id) = stem.parse::<u32>() {
            ids.push(id);
          }
        }
      }
    }
    ids.sort_unstable();
    Ok(ids)
  }

  fn open_reader(&self, id: u32) -> Result<Box<dyn SnapshotReader>> {
    let path = self.snapshot_path(id);
    let mut file = File::open(&path).map_err(|error| match error.kind() {
      std::io::ErrorKind::NotFound => KeelError::NoSuchSnapshot(id),
      _ => KeelError::Io(error),
    })?;

    let mut header_bytes = vec![0u8; SNAPSHOT_HEADER_SIZE as usize];
    file.read_exact(&mut header_bytes)?;
    let header = SnapshotHeader::decode(&header_bytes)?;
    if header.snapshot_id != id {
      return Err(KeelError::Snapshot(format!(
        "snapshot id mismatch in {}: header says {}",
        path.display(),
        header.snapshot_id
      )));
    }

    let mut meta_bytes = vec![0u8; header.meta_size as usize];
    file.read_exact(&mut meta_bytes)?;
    let meta = decode_snapshot_meta(&meta_bytes)?;

    file.seek(SeekFrom::Start(header.body_offset()))?;
    let mut compressed = Vec::with_capacity(header.compressed_length as usize);
    file.take(header.compressed_length).read_to_end(&mut compressed)?;
    if compressed.len() as u64 != header.compressed_length {
      return Err(KeelError::Snapshot(format!(
        "snapshot {} body is truncated",
        path.display()
      )));
    }
    let computed = checksum(&compressed);
    if computed != header.checksum {
      return Err(KeelError::ChecksumMismatch {
        stored: header.checksum,
        computed,
      });
    }

    let body: Box<dyn Read + Send> = match header.codec {
      SnapshotCodec::None => Box::new(std::io::Cursor::new(compressed)),
      SnapshotCodec::Zstd => Box::new(
        zstd::stream::read::Decoder::new(std::io::Cursor::new(compressed))
          .map_err(|error| KeelError::Snapshot(format!("zstd decoder: {error}")))?,
      ),
      SnapshotCodec::Deflate => Box::new(flate2::read::DeflateDecoder::new(std::io::Cursor::new(
        compressed,
      ))),
    };

    Ok(Box::new(FileSnapshotReader {
      snapshot_id: id,
      meta,
      body,
    }))
  }

  fn open_writer(&self, id: u32, meta: SnapshotMeta) -> Result<Box<dyn SnapshotWriter>> {
    let final_path = self.snapshot_path(id);
    if final_path.exists() {
      return Err(KeelError::Snapshot(format!(
        "snapshot {} already exists",
        final_path.display()
      )));
    }
    let tmp_path = tmp_sibling(&final_path);
    let mut file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&tmp_path)?;

    let meta_bytes = encode_snapshot_meta(&meta);
    let header = SnapshotHeader {
      snapshot_id: id,
      codec: self.config.codec,
      compressed_length: 0,
      uncompressed_length: 0,
      checksum: 0,
      meta_size: meta_bytes.len() as u32,
    };
    file.write_all(&header.encode())?;
    file.write_all(&meta_bytes)?;
    let padded = crate::changelog::format::align_up(
      meta_bytes.len() as u64,
      SNAPSHOT_META_ALIGNMENT,
    ) - meta_bytes.len() as u64;
    file.write_all(&vec![0u8; padded as usize])?;

    let sink = HashingFile {
      file,
      hasher: xxhash_rust::xxh64::Xxh64::new(0),
      written: 0,
    };
    let encoder: BodyEncoder = match self.config.codec {
      SnapshotCodec::None => BodyEncoder::Plain(sink),
      SnapshotCodec::Zstd => BodyEncoder::Zstd(
        zstd::stream::write::Encoder::new(sink, 0)
          .map_err(|error| KeelError::Snapshot(format!("zstd encoder: {error}")))?,
      ),
      SnapshotCodec::Deflate => BodyEncoder::Deflate(flate2::write::DeflateEncoder::new(
        sink,
        flate2::Compression::default(),
      )),
    };

    Ok(Box::new(FileSnapshotWriter {
      snapshot_id: id,
      header,
      tmp_path,
      final_path,
      encoder: Some(encoder),
      uncompressed: 0,
    }))
  }

  fn remove(&self, id: u32) -> Result<()> {
    let path = self.snapshot_path(id);
    if path.exists() {
      std::fs::remove_file(&path)?;
      sync_parent_dir(Some(&self.dir))?;
    }
    tracing::debug!(snapshot_id = id, "snapshot removed");
    Ok(())
  }

  fn read_raw(&self, id: u32, offset: u64, max_bytes: u64) -> Result<Vec<u8>> {
    let path = self.snapshot_path(id);
    let mut file = File::open(&path).map_err(|error| match error.kind() {
      std::io::ErrorKind::NotFound => KeelError::NoSuchSnapshot(id),
      _ => KeelError::Io(error),
    })?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::new();
    file.take(max_bytes).read_to_end(&mut bytes)?;
    Ok(bytes)
  }
}

struct FileSnapshotReader {
  snapshot_id: u32,
  meta: SnapshotMeta,
  body: Box<dyn Read + Send>,
}

impl Read for FileSnapshotReader {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    self.body.read(buf)
  }
}

impl SnapshotReader for FileSnapshotReader {
  fn snapshot_id(&self) -> u32 {
    self.snapshot_id
  }

  fn meta(&self) -> &SnapshotMeta {
    &self.meta
  }
}

struct HashingFile {
  file: File,
  hasher: xxhash_rust::xxh64::Xxh64,
  written: u64,
}

impl Write for HashingFile {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    let written = self.file.write(buf)?;
    self.hasher.update(&buf[..written]);
    self.written += written as u64;
    Ok(written)
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.file.flush()
  }
}

enum BodyEncoder {
  Plain(HashingFile),
  Zstd(zstd::stream::write::Encoder<'static, HashingFile>),
  Deflate(flate2::write::DeflateEncoder<HashingFile>),
}

impl BodyEncoder {
  fn writer(&mut self) -> &mut dyn Write {
    match self {
      BodyEncoder::Plain(sink) => sink,
      BodyEncoder::Zstd(encoder) => encoder,
      BodyEncoder::Deflate(encoder) => encoder,
    }
  }

  fn finish(self) -> Result<HashingFile> {
    match self {
      BodyEncoder::Plain(sink) => Ok(sink),
      BodyEncoder::Zstd(encoder) => encoder
        .finish()
        .map_err(|error| KeelError::Snapshot(format!("zstd finish: {error}"))),
      BodyEncoder::Deflate(encoder) => encoder
        .finish()
        .map_err(|error| KeelError::Snapshot(format!("deflate finish: {error}"))),
    }
  }
}

struct FileSnapshotWriter {
  snapshot_id: u32,
  header: SnapshotHeader,
  tmp_path: PathBuf,
  final_path: PathBuf,
  encoder: Option<BodyEncoder>,
  uncompressed: u64,
}

impl Write for FileSnapshotWriter {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    let encoder = self
      .encoder
      .as_mut()
      .expect("snapshot writer already finished");
    let written = encoder.writer().write(buf)?;
    self.uncompressed += written as u64;
    Ok(written)
  }

  fn flush(&mut self) -> std::io::Result<()> {
    match self.encoder.as_mut() {
      Some(encoder) => encoder.writer().flush(),
      None => Ok(()),
    }
  }
}

impl SnapshotWriter for FileSnapshotWriter {
  fn finish(mut self: Box<Self>) -> Result<SnapshotParams> {
    let encoder = self
      .encoder
      .take()
      .expect("snapshot writer already finished");
    let sink = encoder.finish()?;
    let params = SnapshotParams {
      checksum: sink.hasher.digest(),
      compressed_length: sink.written,
      uncompressed_length: self.uncompressed,
    };

    let mut file = sink.file;
    self.header.compressed_length = params.compressed_length;
    self.header.uncompressed_length = params.uncompressed_length;
    self.header.checksum = params.checksum;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&self.header.encode())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&self.tmp_path, &self.final_path)?;
    sync_parent_dir(self.final_path.parent())?;

    tracing::debug!(
      snapshot_id = self.snapshot_id,
      compressed = params.compressed_length,
      uncompressed = params.uncompressed_length,
      "snapshot written"
    );
    Ok(params)
  }
}

impl Drop for FileSnapshotWriter {
  fn drop(&mut self) {
    // An unfinished writer leaves only the tmp file behind.
    if self.encoder.take().is_some() {
      let _ = std::fs::remove_file(&self.tmp_path);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn store_with_codec(dir: &Path, codec: SnapshotCodec) -> Arc<FileSnapshotStore> {
    FileSnapshotStore::open_store(
      dir,
      SnapshotConfig {
        codec,
        max_snapshot_count_to_keep: 3,
      },
    )
    .expect("open store")
  }

  fn sample_meta() -> SnapshotMeta {
    SnapshotMeta {
      sequence_number: 42,
      random_seed: 1,
      state_hash: 2,
      timestamp_micros: 3,
      last_segment_id: 4,
      last_record_id: 5,
      last_mutation_term: 6,
      term: 7,
    }
  }

  #[test]
  fn write_read_roundtrip_all_codecs() {
    for codec in [
      SnapshotCodec::None,
      SnapshotCodec::Zstd,
      SnapshotCodec::Deflate,
    ] {
      let dir = tempdir().expect("tempdir");
      let store = store_with_codec(dir.path(), codec);
      let body: Vec<u8> = (0..100_000u32).map(|value| value as u8).collect();

      let mut writer = store.open_writer(3, sample_meta()).expect("writer");
      writer.write_all(&body).expect("write");
      writer.finish().expect("finish");

      assert_eq!(store.latest_id(u32::MAX).expect("latest"), Some(3));
      assert_eq!(store.latest_id(2).expect("latest below"), None);

      let mut reader = store.open_reader(3).expect("reader");
      assert_eq!(reader.meta().sequence_number, 42);
      let mut back = Vec::new();
      reader.read_to_end(&mut back).expect("read body");
      assert_eq!(back, body);
    }
  }

  #[test]
  fn corrupt_body_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = store_with_codec(dir.path(), SnapshotCodec::Zstd);
    let mut writer = store.open_writer(1, sample_meta()).expect("writer");
    writer.write_all(&[7u8; 4096]).expect("write");
    writer.finish().expect("finish");

    let path = store.snapshot_path(1);
    let mut bytes = std::fs::read(&path).expect("read");
    let len = bytes.len();
    bytes[len - 1] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("write corrupted");

    assert!(matches!(
      store.open_reader(1),
      Err(KeelError::ChecksumMismatch { .. })
    ));
  }

  #[test]
  fn unfinished_writer_leaves_no_snapshot() {
    let dir = tempdir().expect("tempdir");
    let store = store_with_codec(dir.path(), SnapshotCodec::None);
    {
      let mut writer = store.open_writer(9, sample_meta()).expect("writer");
      writer.write_all(b"partial").expect("write");
      // Dropped without finish.
    }
    assert_eq!(store.latest_id(u32::MAX).expect("latest"), None);
    assert!(matches!(
      store.open_reader(9),
      Err(KeelError::NoSuchSnapshot(9))
    ));
  }

  #[test]
  fn raw_reads_bypass_header() {
    let dir = tempdir().expect("tempdir");
    let store = store_with_codec(dir.path(), SnapshotCodec::None);
    let mut writer = store.open_writer(2, sample_meta()).expect("writer");
    writer.write_all(b"0123456789").expect("write");
    writer.finish().expect("finish");

    let whole = store.read_raw(2, 0, u64::MAX).expect("raw");
    let tail = store.read_raw(2, 4, u64::MAX).expect("raw tail");
    assert_eq!(&whole[4..], &tail[..]);
  }
}
