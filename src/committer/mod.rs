//! Mutation committers: ordering, batching, replication, acknowledgement.

pub mod follower;
pub mod leader;

pub use follower::FollowerCommitter;
pub use leader::LeaderCommitter;
