use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use bb8::{Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager;
use bitcoin::hashes::{sha256, Hash};
use parking_lot::Mutex;
use tokio_postgres::NoTls;

use crate::config::Postgres as PostgresConfig;
use crate::database::Db;
use super::LockBackend;

/// Each held lock pins a connection, the pool must be large enough
/// for a tick's worth of locks plus the session service.
const POOL_SIZE: u32 = 16;

type Conn = PooledConnection<'static, PostgresConnectionManager<NoTls>>;

/// The advisory lock id for a key.
fn lock_id(key: &str) -> i64 {
	let hash = sha256::Hash::hash(key.as_bytes());
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&hash.as_byte_array()[..8]);
	i64::from_be_bytes(buf)
}

/// Splits a lock id the way `pg_locks` shows bigint advisory locks.
fn lock_columns(id: i64) -> (u32, u32) {
	let id = id as u64;
	((id >> 32) as u32, id as u32)
}

/// [LockBackend] on top of session-level postgres advisory locks.
///
/// A lock belongs to the connection that took it, so the connection is
/// kept out of the pool until the lock is released.
pub struct PgLockBackend {
	pool: Pool<PostgresConnectionManager<NoTls>>,
	held: Mutex<HashMap<String, Conn>>,
	/// Upper bound on waiting for a pooled connection.
	acquire_timeout: Duration,
}

impl PgLockBackend {
	/// Waiting for a pooled connection is bounded by `lock_timeout`.
	pub async fn connect(config: &PostgresConfig, lock_timeout: Duration) -> anyhow::Result<PgLockBackend> {
		let manager = PostgresConnectionManager::new(Db::config(&config.name, config), NoTls);
		let pool = Pool::builder()
			.max_size(POOL_SIZE)
			.connection_timeout(lock_timeout)
			.build(manager).await
			.context("failed to create lock connection pool")?;
		Ok(PgLockBackend::with_pool(pool, lock_timeout))
	}

	fn with_pool(pool: Pool<PostgresConnectionManager<NoTls>>, acquire_timeout: Duration) -> PgLockBackend {
		PgLockBackend {
			pool,
			held: Mutex::new(HashMap::new()),
			acquire_timeout,
		}
	}

	async fn conn(&self) -> anyhow::Result<Conn> {
		match tokio::time::timeout(self.acquire_timeout, self.pool.get_owned()).await {
			Ok(res) => res.context("failed to get a lock connection"),
			Err(_) => bail!("no lock connection available within {:?}", self.acquire_timeout),
		}
	}
}

#[async_trait]
impl LockBackend for PgLockBackend {
	async fn try_lock(&self, key: &str) -> anyhow::Result<bool> {
		// advisory locks are re-entrant per connection, not per key holder
		if self.held.lock().contains_key(key) {
			return Ok(false);
		}

		let conn = self.conn().await?;
		let row = conn.query_one("SELECT pg_try_advisory_lock($1)", &[&lock_id(key)]).await?;
		let locked = row.get::<_, bool>(0);
		if locked {
			self.held.lock().insert(key.to_owned(), conn);
		}
		Ok(locked)
	}

	async fn unlock(&self, key: &str) -> anyhow::Result<()> {
		let conn = self.held.lock().remove(key)
			.with_context(|| format!("lock {} is not held", key))?;
		let row = conn.query_one("SELECT pg_advisory_unlock($1)", &[&lock_id(key)]).await?;
		if !row.get::<_, bool>(0) {
			warn!("Advisory lock {} was not held by its connection", key);
		}
		Ok(())
	}

	async fn is_locked(&self, key: &str) -> anyhow::Result<bool> {
		let (classid, objid) = lock_columns(lock_id(key));
		let conn = self.conn().await?;
		let row = conn.query_one("
			SELECT COUNT(*) FROM pg_locks
			WHERE locktype = 'advisory' AND classid = $1 AND objid = $2
				AND objsubid = 1 AND granted
		", &[&classid, &objid]).await?;
		Ok(row.get::<_, i64>(0) > 0)
	}
}

#[cfg(test)]
mod test {
	use std::time::Instant;

	use crate::config::Config;
	use super::*;

	#[tokio::test]
	async fn unreachable_pool_gives_up_within_lock_timeout() {
		let mut cfg = Config::default().postgres;
		cfg.host = "127.0.0.1".into();
		// nothing listens there
		cfg.port = 1;
		let manager = PostgresConnectionManager::new(Db::config(&cfg.name, &cfg), NoTls);
		let pool = Pool::builder().max_size(1).build_unchecked(manager);
		let backend = PgLockBackend::with_pool(pool, Duration::from_millis(200));

		let start = Instant::now();
		assert!(backend.try_lock("sessions:1").await.is_err());
		assert!(backend.is_locked("sessions:1").await.is_err());
		assert!(start.elapsed() < Duration::from_secs(5), "waited {:?}", start.elapsed());
		assert!(backend.held.lock().is_empty());
	}

	#[test]
	fn lock_ids() {
		assert_eq!(lock_id("sessions:1"), lock_id("sessions:1"));
		assert_ne!(lock_id("sessions:1"), lock_id("sessions:2"));

		assert_eq!(lock_columns(0x0000_0001_0000_0002), (1, 2));
		assert_eq!(lock_columns(-1), (u32::MAX, u32::MAX));
	}
}
