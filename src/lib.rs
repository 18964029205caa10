//! Keel - replicated deterministic state-machine engine
//!
//! A fixed cell of peers cooperatively executes an ordered sequence of
//! mutations against an in-memory automaton. Every peer that reaches
//! sequence number N has applied exactly the same mutations 0..N-1 in the
//! same order, with byte-identical state.
//!
//! # Architecture
//!
//! - **Changelog**: segmented, append-only, crash-safe record log with a
//!   sparse index and batched asynchronous flushing
//! - **Snapshots**: periodic full-state captures bounding recovery work
//!   (fork and no-fork builders)
//! - **Commit pipeline**: the leader orders, logs, replicates and
//!   acknowledges mutations after a durable quorum
//! - **Leases**: quorum-granted, time-bounded leadership
//! - **Recovery**: snapshot load plus contiguous changelog replay

// Core modules
pub mod config;
pub mod error;
pub mod types;
pub mod util;

// Execution contexts
pub mod runtime;

// Storage layer
pub mod changelog;
pub mod snapshot;

// The automaton and its decoration
pub mod automaton;

// Replication
pub mod checkpointer;
pub mod committer;
pub mod lease;
pub mod recovery;

// External collaborators (consumed contracts + local implementations)
pub mod cell;
pub mod election;
pub mod keeper;
pub mod rpc;

// Top-level glue
pub mod engine;

// Re-export commonly used items
pub use automaton::{Automaton, DecoratedAutomaton, MutationContext};
pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent, EngineOptions};
pub use error::{KeelError, Result};
pub use types::{MutationRequest, MutationResponse, PeerState, Version};
