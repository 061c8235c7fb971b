//! In-process lock backend for single-instance deployments and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{DistributedLock, LockError, new_owner_id};

/// Shared state behind every [`MemoryLock`] handle of one "deployment".
///
/// Each handle gets its own owner identity, so two handles built from the
/// same backend contend exactly like two processes would.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
	locks: Mutex<HashMap<String, Holder>>,
}

#[derive(Debug)]
struct Holder {
	owner: String,
	expires_at: Instant,
}

impl MemoryLockBackend {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Create a lock handle with a fresh owner identity.
	pub fn handle(self: &Arc<Self>) -> MemoryLock {
		MemoryLock {
			backend: Arc::clone(self),
			owner: new_owner_id(),
		}
	}
}

/// One process's view of the in-memory lock backend.
#[derive(Debug, Clone)]
pub struct MemoryLock {
	backend: Arc<MemoryLockBackend>,
	owner: String,
}

impl MemoryLock {
	/// Standalone lock with a private backend.
	pub fn new() -> Self {
		MemoryLockBackend::new().handle()
	}

	/// The owner identity this handle acquires with.
	pub fn owner(&self) -> &str {
		&self.owner
	}
}

impl Default for MemoryLock {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl DistributedLock for MemoryLock {
	async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
		let mut locks = self.backend.locks.lock().unwrap();
		let now = Instant::now();

		match locks.get(name) {
			Some(holder) if holder.expires_at > now => Ok(false),
			_ => {
				locks.insert(
					name.to_string(),
					Holder {
						owner: self.owner.clone(),
						expires_at: now + ttl,
					},
				);
				Ok(true)
			}
		}
	}

	async fn release(&self, name: &str) -> Result<(), LockError> {
		let mut locks = self.backend.locks.lock().unwrap();
		if locks.get(name).is_some_and(|h| h.owner == self.owner) {
			locks.remove(name);
		}
		Ok(())
	}

	async fn extend(&self, name: &str, ttl: Duration) -> Result<(), LockError> {
		let mut locks = self.backend.locks.lock().unwrap();
		let now = Instant::now();

		match locks.get_mut(name) {
			Some(holder) if holder.owner == self.owner && holder.expires_at > now => {
				holder.expires_at = now + ttl;
				Ok(())
			}
			_ => Err(LockError::NotHeld),
		}
	}

	async fn ping(&self) -> Result<(), LockError> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn acquire_is_mutually_exclusive() {
		let backend = MemoryLockBackend::new();
		let a = backend.handle();
		let b = backend.handle();

		assert!(a.acquire("x", Duration::from_secs(10)).await.unwrap());
		assert!(!b.acquire("x", Duration::from_secs(10)).await.unwrap());

		a.release("x").await.unwrap();
		assert!(b.acquire("x", Duration::from_secs(10)).await.unwrap());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn ttl_frees_a_dead_holders_lock() {
		let backend = MemoryLockBackend::new();
		let a = backend.handle();
		let b = backend.handle();

		assert!(a.acquire("x", Duration::from_secs(10)).await.unwrap());
		assert!(!b.acquire("x", Duration::from_secs(10)).await.unwrap());

		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(b.acquire("x", Duration::from_secs(10)).await.unwrap());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn release_by_non_owner_is_a_noop() {
		let backend = MemoryLockBackend::new();
		let a = backend.handle();
		let b = backend.handle();

		assert!(a.acquire("x", Duration::from_secs(10)).await.unwrap());
		b.release("x").await.unwrap();

		// Still held by a.
		assert!(!b.acquire("x", Duration::from_secs(10)).await.unwrap());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn extend_by_non_owner_fails() {
		let backend = MemoryLockBackend::new();
		let a = backend.handle();
		let b = backend.handle();

		assert!(a.acquire("x", Duration::from_secs(10)).await.unwrap());
		assert!(matches!(
			b.extend("x", Duration::from_secs(10)).await,
			Err(LockError::NotHeld)
		));
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn extend_pushes_expiry_out() {
		let backend = MemoryLockBackend::new();
		let a = backend.handle();
		let b = backend.handle();

		assert!(a.acquire("x", Duration::from_secs(10)).await.unwrap());
		tokio::time::advance(Duration::from_secs(8)).await;
		a.extend("x", Duration::from_secs(10)).await.unwrap();

		tokio::time::advance(Duration::from_secs(8)).await;
		// 16s elapsed since acquire, but only 8s since extend.
		assert!(!b.acquire("x", Duration::from_secs(10)).await.unwrap());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn extend_after_expiry_fails() {
		let a = MemoryLock::new();

		assert!(a.acquire("x", Duration::from_secs(10)).await.unwrap());
		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(matches!(
			a.extend("x", Duration::from_secs(10)).await,
			Err(LockError::NotHeld)
		));
	}
}
