//! Postgres advisory-lock backend.
//!
//! Each held lock pins one pool connection: advisory locks are scoped
//! to the session that took them, so Postgres frees the lock if that
//! connection dies. The requested TTL is therefore best-effort — the
//! real bound is connection lifetime — and `extend` succeeds as a
//! no-op while the lock is held. Deployments that need hard TTLs use
//! the Redis backend instead.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use tokio::sync::Mutex;

use crate::{DistributedLock, LockError};

/// Distributed lock over Postgres session advisory locks.
pub struct PgAdvisoryLock {
	pool: PgPool,
	held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgAdvisoryLock {
	pub fn new(pool: PgPool) -> Self {
		Self {
			pool,
			held: Mutex::new(HashMap::new()),
		}
	}

	/// Map a lock name onto the advisory-lock key space.
	fn advisory_key(name: &str) -> i64 {
		let digest = Sha256::digest(name.as_bytes());
		let mut bytes = [0u8; 8];
		bytes.copy_from_slice(&digest[..8]);
		i64::from_be_bytes(bytes)
	}
}

impl std::fmt::Debug for PgAdvisoryLock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PgAdvisoryLock").finish_non_exhaustive()
	}
}

#[async_trait]
impl DistributedLock for PgAdvisoryLock {
	async fn acquire(&self, name: &str, _ttl: Duration) -> Result<bool, LockError> {
		let mut held = self.held.lock().await;
		if held.contains_key(name) {
			// This process already owns the lock on a pinned session.
			return Ok(false);
		}

		let mut conn = self
			.pool
			.acquire()
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;

		let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
			.bind(Self::advisory_key(name))
			.fetch_one(&mut *conn)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;

		if locked {
			held.insert(name.to_string(), conn);
		}
		Ok(locked)
	}

	async fn release(&self, name: &str) -> Result<(), LockError> {
		let Some(mut conn) = self.held.lock().await.remove(name) else {
			// Not the owner: no-op.
			return Ok(());
		};

		sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
			.bind(Self::advisory_key(name))
			.fetch_one(&mut *conn)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn extend(&self, name: &str, _ttl: Duration) -> Result<(), LockError> {
		let mut held = self.held.lock().await;
		let Some(conn) = held.get_mut(name) else {
			return Err(LockError::NotHeld);
		};

		// No TTL to push: verify the pinned session is still alive, which
		// is what actually keeps the lock held.
		sqlx::query("SELECT 1")
			.execute(&mut **conn)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn ping(&self) -> Result<(), LockError> {
		sqlx::query("SELECT 1")
			.execute(&self.pool)
			.await
			.map(|_| ())
			.map_err(|e| LockError::Backend(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn advisory_keys_are_stable_and_distinct() {
		assert_eq!(
			PgAdvisoryLock::advisory_key("scheduler"),
			PgAdvisoryLock::advisory_key("scheduler")
		);
		assert_ne!(
			PgAdvisoryLock::advisory_key("scheduler"),
			PgAdvisoryLock::advisory_key("other")
		);
	}
}
