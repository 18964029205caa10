//! Snapshot files, store and builders.

pub mod builder;
pub mod format;
pub mod store;

pub use format::SnapshotMeta;
pub use store::{
  FileSnapshotStore, SnapshotParams, SnapshotReader, SnapshotStore, SnapshotWriter,
};
