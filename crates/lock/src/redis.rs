//! Redis lock backend.
//!
//! `acquire` is one atomic `SET key owner NX PX ttl`. `release` and
//! `extend` are Lua scripts that compare the stored owner before
//! deleting or re-expiring, so a process can never clobber a lock it
//! lost to a TTL expiry.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use crate::{DistributedLock, LockError, new_owner_id};

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	return redis.call('DEL', KEYS[1])
end
return 0
";

const EXTEND_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Distributed lock over a shared Redis instance.
#[derive(Clone)]
pub struct RedisLock {
	conn: ConnectionManager,
	owner: String,
}

impl RedisLock {
	/// Wrap an established connection manager.
	pub fn new(conn: ConnectionManager) -> Self {
		Self {
			conn,
			owner: new_owner_id(),
		}
	}

	/// Connect to `url` and build a lock handle.
	pub async fn connect(url: &str) -> Result<Self, LockError> {
		let client = redis::Client::open(url).map_err(|e| LockError::Backend(e.to_string()))?;
		let conn = ConnectionManager::new(client)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;
		Ok(Self::new(conn))
	}

	fn key(name: &str) -> String {
		format!("sercha:lock:{name}")
	}
}

impl std::fmt::Debug for RedisLock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisLock").field("owner", &self.owner).finish_non_exhaustive()
	}
}

#[async_trait]
impl DistributedLock for RedisLock {
	async fn acquire(&self, name: &str, ttl: Duration) -> Result<bool, LockError> {
		let mut conn = self.conn.clone();
		let reply: Option<String> = redis::cmd("SET")
			.arg(Self::key(name))
			.arg(&self.owner)
			.arg("NX")
			.arg("PX")
			.arg(ttl.as_millis() as u64)
			.query_async(&mut conn)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;

		Ok(reply.is_some())
	}

	async fn release(&self, name: &str) -> Result<(), LockError> {
		let mut conn = self.conn.clone();
		let _deleted: i64 = Script::new(RELEASE_SCRIPT)
			.key(Self::key(name))
			.arg(&self.owner)
			.invoke_async(&mut conn)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn extend(&self, name: &str, ttl: Duration) -> Result<(), LockError> {
		let mut conn = self.conn.clone();
		let extended: i64 = Script::new(EXTEND_SCRIPT)
			.key(Self::key(name))
			.arg(&self.owner)
			.arg(ttl.as_millis() as u64)
			.invoke_async(&mut conn)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))?;

		if extended == 0 {
			return Err(LockError::NotHeld);
		}
		Ok(())
	}

	async fn ping(&self) -> Result<(), LockError> {
		let mut conn = self.conn.clone();
		redis::cmd("PING")
			.query_async::<()>(&mut conn)
			.await
			.map_err(|e| LockError::Backend(e.to_string()))
	}
}
