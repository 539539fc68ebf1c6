
#[cfg(test)]
pub mod memory;

use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};

use crate::database::model::{
	NewReceiveSession, NewSendSession, ReceiveSession, SeenInput, SendSession,
};


/// The slice of sessions a single replica is responsible for.
///
/// Replica `n` out of `total` picks all sessions where `id % total == n - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
	/// 1-based
	pub replica_id: u32,
	pub total_replicas: u32,
}

impl Partition {
	pub const SINGLE: Partition = Partition { replica_id: 1, total_replicas: 1 };

	pub fn contains(&self, id: i64) -> bool {
		id.rem_euclid(self.total_replicas as i64) == self.replica_id as i64 - 1
	}
}

/// Durable storage for send and receive sessions and seen inputs.
///
/// Reads that return [Option] yield [None] when no such row exists.
#[async_trait]
pub trait SessionRepository: Send + Sync + 'static {
	/**
	 * Receive sessions
	*/

	async fn create_receive_session(&self, new: NewReceiveSession) -> anyhow::Result<ReceiveSession>;

	async fn get_receive_session(&self, id: i64) -> anyhow::Result<Option<ReceiveSession>>;

	/// The most recent receive session for this address.
	async fn get_receive_session_by_address(
		&self,
		address: &str,
	) -> anyhow::Result<Option<ReceiveSession>>;

	/// Sessions without txid, not confirmed, not cancelled and not yet expired.
	async fn list_active_receive_sessions(
		&self,
		partition: Partition,
		now: DateTime<Utc>,
	) -> anyhow::Result<Vec<ReceiveSession>>;

	/// Sessions with a stored fallback tx that failed before the given time
	/// and never got a txid.
	async fn list_fallback_candidates(
		&self,
		partition: Partition,
		failed_before: DateTime<Utc>,
	) -> anyhow::Result<Vec<ReceiveSession>>;

	/// Overwrite all mutable columns of the session.
	async fn update_receive_session(&self, session: &ReceiveSession) -> anyhow::Result<()>;

	/// Stamp the failure time, unless one is set already.
	async fn mark_receive_failed(&self, id: i64, at: DateTime<Utc>) -> anyhow::Result<()>;

	/**
	 * Send sessions
	*/

	async fn create_send_session(&self, new: NewSendSession) -> anyhow::Result<SendSession>;

	async fn get_send_session(&self, id: i64) -> anyhow::Result<Option<SendSession>>;

	async fn get_send_session_by_txid(&self, txid: Txid) -> anyhow::Result<Option<SendSession>>;

	async fn list_active_send_sessions(
		&self,
		partition: Partition,
		now: DateTime<Utc>,
	) -> anyhow::Result<Vec<SendSession>>;

	async fn update_send_session(&self, session: &SendSession) -> anyhow::Result<()>;

	/**
	 * Seen inputs
	*/

	async fn list_seen_inputs(&self) -> anyhow::Result<Vec<SeenInput>>;

	/// Store the inputs, keeping the existing tag of inputs that are already known.
	async fn store_seen_inputs(&self, inputs: &[OutPoint], bip21: &str) -> anyhow::Result<()>;
}
