use std::collections::HashSet;

use parking_lot::Mutex;

use super::LockBackend;


/// An in-process [LockBackend].
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
	locked: Mutex<HashSet<String>>,
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
	async fn try_lock(&self, key: &str) -> anyhow::Result<bool> {
		Ok(self.locked.lock().insert(key.to_owned()))
	}

	async fn unlock(&self, key: &str) -> anyhow::Result<()> {
		self.locked.lock().remove(key);
		Ok(())
	}

	async fn is_locked(&self, key: &str) -> anyhow::Result<bool> {
		Ok(self.locked.lock().contains(key))
	}
}
