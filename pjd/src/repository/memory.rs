//! A [SessionRepository] that keeps everything in memory.

use std::collections::BTreeMap;

use anyhow::Context;
use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::database::model::{
	NewReceiveSession, NewSendSession, ReceiveSession, SeenInput, SendSession,
};
use super::{Partition, SessionRepository};


#[derive(Default)]
struct Tables {
	next_id: i64,
	receive: BTreeMap<i64, ReceiveSession>,
	send: BTreeMap<i64, SendSession>,
	seen: BTreeMap<OutPoint, String>,
}

#[derive(Default)]
pub struct MemoryRepository {
	tables: Mutex<Tables>,
	/// When set, [SessionRepository::list_seen_inputs] fails.
	pub fail_seen_inputs: std::sync::atomic::AtomicBool,
	/// [SessionRepository::list_seen_inputs] waits while this is write-locked.
	pub hold_seen_inputs: tokio::sync::RwLock<()>,
}

impl MemoryRepository {
	pub fn new() -> MemoryRepository {
		MemoryRepository::default()
	}

	fn next_id(t: &mut Tables) -> i64 {
		t.next_id += 1;
		t.next_id
	}

	/// Insert a session as is, useful to set up state directly.
	pub fn insert_receive(&self, session: ReceiveSession) {
		let mut t = self.tables.lock();
		t.next_id = t.next_id.max(session.id);
		t.receive.insert(session.id, session);
	}

	pub fn receive(&self, id: i64) -> ReceiveSession {
		self.tables.lock().receive.get(&id).cloned().expect("no such receive session")
	}

	pub fn send(&self, id: i64) -> SendSession {
		self.tables.lock().send.get(&id).cloned().expect("no such send session")
	}

	pub fn seen(&self) -> BTreeMap<OutPoint, String> {
		self.tables.lock().seen.clone()
	}
}

#[async_trait]
impl SessionRepository for MemoryRepository {
	async fn create_receive_session(&self, new: NewReceiveSession) -> anyhow::Result<ReceiveSession> {
		let mut t = self.tables.lock();
		let id = Self::next_id(&mut t);
		let session = ReceiveSession {
			id,
			address: new.address,
			bip21: new.bip21,
			amount: new.amount,
			session: new.session,
			callback_url: new.callback_url,
			expiry_at: new.expiry_at,
			created_at: Utc::now(),
			first_seen_at: None,
			confirmed_at: None,
			cancelled_at: None,
			failed_at: None,
			fallback_at: None,
			non_payjoin_at: None,
			called_back_at: None,
			txid: None,
			fallback_tx_hex: None,
			fee: None,
			receiver_fee: None,
			receiver_in_amount: None,
			receiver_out_amount: None,
		};
		t.receive.insert(id, session.clone());
		Ok(session)
	}

	async fn get_receive_session(&self, id: i64) -> anyhow::Result<Option<ReceiveSession>> {
		Ok(self.tables.lock().receive.get(&id).cloned())
	}

	async fn get_receive_session_by_address(
		&self,
		address: &str,
	) -> anyhow::Result<Option<ReceiveSession>> {
		Ok(self.tables.lock().receive.values().rev()
			.find(|s| s.address == address)
			.cloned())
	}

	async fn list_active_receive_sessions(
		&self,
		partition: Partition,
		now: DateTime<Utc>,
	) -> anyhow::Result<Vec<ReceiveSession>> {
		Ok(self.tables.lock().receive.values()
			.filter(|s| partition.contains(s.id) && s.is_active(now))
			.cloned()
			.collect())
	}

	async fn list_fallback_candidates(
		&self,
		partition: Partition,
		failed_before: DateTime<Utc>,
	) -> anyhow::Result<Vec<ReceiveSession>> {
		Ok(self.tables.lock().receive.values()
			.filter(|s| partition.contains(s.id))
			.filter(|s| s.txid.is_none() && s.fallback_tx_hex.is_some())
			.filter(|s| s.cancelled_at.is_none() && s.confirmed_at.is_none())
			.filter(|s| s.failed_at.map(|f| f < failed_before).unwrap_or(false))
			.cloned()
			.collect())
	}

	async fn update_receive_session(&self, session: &ReceiveSession) -> anyhow::Result<()> {
		let mut t = self.tables.lock();
		let slot = t.receive.get_mut(&session.id).context("no such receive session")?;
		*slot = session.clone();
		Ok(())
	}

	async fn mark_receive_failed(&self, id: i64, at: DateTime<Utc>) -> anyhow::Result<()> {
		let mut t = self.tables.lock();
		let s = t.receive.get_mut(&id).context("no such receive session")?;
		if s.failed_at.is_none() {
			s.failed_at = Some(at);
		}
		Ok(())
	}

	async fn create_send_session(&self, new: NewSendSession) -> anyhow::Result<SendSession> {
		let mut t = self.tables.lock();
		let id = Self::next_id(&mut t);
		let session = SendSession {
			id,
			address: new.address,
			bip21: new.bip21,
			amount: new.amount,
			session: new.session,
			callback_url: new.callback_url,
			expiry_at: new.expiry_at,
			created_at: Utc::now(),
			confirmed_at: None,
			cancelled_at: None,
			called_back_at: None,
			txid: None,
			fee: None,
			sender_fee: None,
		};
		t.send.insert(id, session.clone());
		Ok(session)
	}

	async fn get_send_session(&self, id: i64) -> anyhow::Result<Option<SendSession>> {
		Ok(self.tables.lock().send.get(&id).cloned())
	}

	async fn get_send_session_by_txid(&self, txid: Txid) -> anyhow::Result<Option<SendSession>> {
		Ok(self.tables.lock().send.values().find(|s| s.txid == Some(txid)).cloned())
	}

	async fn list_active_send_sessions(
		&self,
		partition: Partition,
		now: DateTime<Utc>,
	) -> anyhow::Result<Vec<SendSession>> {
		Ok(self.tables.lock().send.values()
			.filter(|s| partition.contains(s.id) && s.is_active(now))
			.cloned()
			.collect())
	}

	async fn update_send_session(&self, session: &SendSession) -> anyhow::Result<()> {
		let mut t = self.tables.lock();
		let slot = t.send.get_mut(&session.id).context("no such send session")?;
		*slot = session.clone();
		Ok(())
	}

	async fn list_seen_inputs(&self) -> anyhow::Result<Vec<SeenInput>> {
		let _hold = self.hold_seen_inputs.read().await;
		if self.fail_seen_inputs.load(std::sync::atomic::Ordering::SeqCst) {
			bail!("database unavailable");
		}
		Ok(self.tables.lock().seen.iter()
			.map(|(o, b)| SeenInput { outpoint: *o, bip21: b.clone() })
			.collect())
	}

	async fn store_seen_inputs(&self, inputs: &[OutPoint], bip21: &str) -> anyhow::Result<()> {
		let mut t = self.tables.lock();
		for input in inputs {
			t.seen.entry(*input).or_insert_with(|| bip21.to_owned());
		}
		Ok(())
	}
}
