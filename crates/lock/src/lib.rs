//! Named cross-instance mutexes with TTL.
//!
//! A lock has an owner identity unique to the acquiring process;
//! `release` and `extend` only act when the caller is the current owner.
//! `acquire` never blocks: it reports whether the lock was taken. The
//! TTL caps the lock's lifetime even if its holder dies.
//!
//! Two production backends are interchangeable behind
//! [`DistributedLock`]: a Redis implementation with atomic
//! set-if-absent and scripted compare-and-delete, and a Postgres
//! advisory-lock implementation whose TTL is best-effort (the lock is
//! released when its session ends). [`MemoryLock`] serves single-process
//! deployments and tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::{MemoryLock, MemoryLockBackend};
pub use self::postgres::PgAdvisoryLock;
pub use self::redis::RedisLock;

/// Errors from lock backends.
#[derive(Debug, Error)]
pub enum LockError {
	/// `extend` was called by a process that does not hold the lock.
	#[error("lock not held")]
	NotHeld,

	/// The backing store failed or is unreachable.
	#[error("lock backend: {0}")]
	Backend(String),
}

/// A named mutex shared by every process using the same backend.
#[async_trait]
pub trait DistributedLock: Send + Sync {
	/// Try to take the lock; `true` when this process now owns it.
	/// Atomic and non-blocking.
	async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError>;

	/// Release the lock. A no-op when this process is not the owner.
	async fn release(&self, name: &str) -> Result<(), LockError>;

	/// Push the lock's expiry out by `ttl`. Fails with
	/// [`LockError::NotHeld`] when this process is not the owner.
	async fn extend(&self, name: &str, ttl: Duration) -> Result<(), LockError>;

	/// Probe backend health.
	async fn ping(&self) -> Result<(), LockError>;
}

/// Build an owner identity unique to this process.
///
/// Host, pid, and a random suffix: survives pid reuse across hosts and
/// distinguishes multiple lock handles within one process.
pub(crate) fn new_owner_id() -> String {
	use rand::RngCore;

	let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
	let mut suffix = [0u8; 4];
	rand::rng().fill_bytes(&mut suffix);
	format!("{host}:{}:{}", std::process::id(), hex_encode(&suffix))
}

fn hex_encode(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn owner_ids_are_unique_per_handle() {
		assert_ne!(new_owner_id(), new_owner_id());
	}
}
