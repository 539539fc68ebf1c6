//! Named locks shared by all replicas.
//!
//! Every mutation of a session happens while holding the lock on its id and
//! its address. The scheduler additionally holds a lock per replica for the
//! duration of a tick.

pub mod postgres;
#[cfg(test)]
pub mod memory;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tokio::time::Instant;


const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The lock key of a session, used by both reconciliation and cancellation.
pub fn session_key(kind: &str, id: i64) -> String {
	format!("{}:{}", kind, id)
}

/// The lock key of a watched address.
pub fn address_key(address: &str) -> String {
	format!("address:{}", address)
}

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for lock {key}")]
pub struct LockTimeout {
	pub key: String,
}

/// A mutual-exclusion service keyed by arbitrary strings.
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
	/// Try to take the lock, returns false if somebody else holds it.
	async fn try_lock(&self, key: &str) -> anyhow::Result<bool>;

	async fn unlock(&self, key: &str) -> anyhow::Result<()>;

	/// Whether anyone, including ourselves, holds the lock.
	async fn is_locked(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct Locker {
	backend: Arc<dyn LockBackend>,
	timeout: Duration,
	poll_interval: Duration,
}

impl Locker {
	pub fn new(backend: Arc<dyn LockBackend>, timeout: Duration) -> Locker {
		Locker {
			backend,
			timeout,
			poll_interval: DEFAULT_POLL_INTERVAL,
		}
	}

	pub fn with_poll_interval(mut self, poll_interval: Duration) -> Locker {
		self.poll_interval = poll_interval;
		self
	}

	/// Run `fut` while holding all the given locks.
	///
	/// Keys are taken in sorted order and released in reverse order. If not
	/// all keys can be taken within the timeout, the ones already held are
	/// released and a [LockTimeout] is returned.
	pub async fn with_lock<K, F, T>(
		&self,
		keys: impl IntoIterator<Item = K>,
		fut: F,
	) -> anyhow::Result<T>
	where
		K: Into<String>,
		F: Future<Output = anyhow::Result<T>>,
	{
		let mut keys = keys.into_iter().map(Into::into).collect::<Vec<String>>();
		keys.sort();
		keys.dedup();

		let deadline = Instant::now() + self.timeout;
		let mut held = Vec::with_capacity(keys.len());
		for key in &keys {
			if let Err(e) = self.acquire(key, deadline).await {
				self.release(&held).await;
				return Err(e);
			}
			trace!("Acquired lock {}", key);
			held.push(key.as_str());
		}

		let res = AssertUnwindSafe(fut).catch_unwind().await;
		self.release(&held).await;
		match res {
			Ok(ret) => ret,
			Err(panic) => std::panic::resume_unwind(panic),
		}
	}

	async fn acquire(&self, key: &str, deadline: Instant) -> anyhow::Result<()> {
		loop {
			let locked = self.backend.try_lock(key).await
				.with_context(|| format!("error taking lock {}", key))?;
			if locked {
				return Ok(());
			}

			let now = Instant::now();
			if now >= deadline {
				return Err(LockTimeout { key: key.to_owned() }.into());
			}
			tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
		}
	}

	async fn release(&self, held: &[&str]) {
		for key in held.iter().rev() {
			if let Err(e) = self.backend.unlock(key).await {
				error!("Failed to release lock {}: {:#}", key, e);
			}
		}
	}

	/// Whether the lock is held by anyone.
	///
	/// Returns true if the backend can't tell.
	pub async fn is_busy(&self, key: &str) -> bool {
		match self.backend.is_locked(key).await {
			Ok(busy) => busy,
			Err(e) => {
				warn!("Error checking status of lock {}, assuming busy: {:#}", key, e);
				true
			},
		}
	}
}
