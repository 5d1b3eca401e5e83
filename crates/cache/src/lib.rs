#![warn(clippy::unwrap_used)]

//! Distributed locking for long-running work that must not run twice at once.
//! Redis `SET NX EX` across processes, or a DashMap for a single process.

pub mod client;
pub mod local;
pub mod lock;

pub use client::{connect, RedisLock};
pub use local::LocalLock;
pub use lock::{generation_timeout_secs, with_lock, DistributedLock};
