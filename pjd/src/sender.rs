//! Drives send sessions until the payjoin transaction is broadcast.
//!
//! The state of a session is the event log of its payjoin sender, replayed
//! at the start of every pass. New events are written back even when the
//! pass fails later on, so a received proposal is never requested twice.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use bitcoin::Psbt;
use chrono::{DateTime, Utc};
use payjoin::persist::OptionalTransitionOutcome;
use payjoin::send::v2::{replay_event_log, SendSession, Sender, V2GetContext};

use crate::config::Config;
use crate::fees;
use crate::lock::{address_key, session_key, LockTimeout, Locker};
use crate::database::model::SendSession as SendSessionRow;
use crate::protocol::{Directory, SenderLog, Transport};
use crate::receiver::PassOutcome;
use crate::repository::SessionRepository;
use crate::wallet::{DecodedPsbt, WalletGateway};


pub const SEND: &str = "send";

pub struct SenderReconciler {
	repo: Arc<dyn SessionRepository>,
	wallet: Arc<dyn WalletGateway>,
	transport: Arc<dyn Transport>,
	directory: Arc<Directory>,
	locker: Locker,
	wallet_name: String,
}

impl SenderReconciler {
	pub fn new(
		cfg: &Config,
		repo: Arc<dyn SessionRepository>,
		wallet: Arc<dyn WalletGateway>,
		transport: Arc<dyn Transport>,
		directory: Arc<Directory>,
		locker: Locker,
	) -> SenderReconciler {
		SenderReconciler {
			repo,
			wallet,
			transport,
			directory,
			locker,
			wallet_name: cfg.send_wallet.clone(),
		}
	}

	/// Run one pass on the session. Never fails, errors end up in the outcome.
	///
	/// Send sessions have no failure stamp, a failed pass is simply retried
	/// on the next tick until the session expires.
	pub async fn reconcile(&self, id: i64, now: DateTime<Utc>) -> PassOutcome {
		let outcome = match self.try_reconcile(id, now).await {
			Ok(o) => o,
			Err(e) => PassOutcome::Failed(e),
		};

		match outcome {
			PassOutcome::Failed(ref e) if e.downcast_ref::<LockTimeout>().is_some() => {
				debug!("Send session {} is busy: {:#}", id, e);
			},
			PassOutcome::Failed(ref e) => {
				slog!(SendSessionFailed, id, error: format!("{:#}", e));
			},
			PassOutcome::Stalled(ref reason) => {
				warn!("Send session {} can't progress right now: {}", id, reason);
			},
			_ => {},
		}
		outcome
	}

	async fn try_reconcile(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<PassOutcome> {
		let session = self.repo.get_send_session(id).await?
			.with_context(|| format!("send session {} not found", id))?;
		if session.txid.is_some() {
			return Ok(PassOutcome::Idle);
		}

		let keys = [session_key(SEND, id), address_key(&session.address)];
		self.locker.with_lock(keys, self.locked_pass(id, now)).await
	}

	async fn locked_pass(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<PassOutcome> {
		let mut session = self.repo.get_send_session(id).await?
			.with_context(|| format!("send session {} not found", id))?;
		if !session.is_active(now) {
			return Ok(PassOutcome::Idle);
		}

		let log = SenderLog::from_json(&session.session)?;
		let nb_events = log.len();
		let outcome = self.negotiate(&mut session, &log).await;

		let completed = matches!(outcome, Ok(PassOutcome::Completed(_)));
		if completed || log.len() != nb_events {
			session.session = log.to_json()?;
			self.repo.update_send_session(&session).await?;
		}
		outcome
	}

	async fn negotiate(&self, session: &mut SendSessionRow, log: &SenderLog) -> anyhow::Result<PassOutcome> {
		let id = session.id;
		let (state, _history) = replay_event_log(log)
			.map_err(|e| anyhow!("failed to replay send session: {}", e))?;
		let proposal = match state {
			SendSession::WithReplyKey(sender) => {
				let (req, ctx) = sender.create_v2_post_request(self.directory.relay.clone())
					.map_err(|e| anyhow!("failed to create original psbt request: {}", e))?;
				let res = self.transport.send(&req).await
					.context("failed to post the original psbt")?;
				let sender = sender.process_response(&res, ctx).save(log)
					.map_err(|e| anyhow!("directory refused the original psbt: {}", e))?;
				debug!("Posted the original psbt of send session {}", id);
				self.poll(&sender, log).await?
			},
			SendSession::V2GetContext(sender) => self.poll(&sender, log).await?,
			SendSession::ProposalReceived(psbt) => Some(psbt),
			_ => return Ok(PassOutcome::Idle),
		};
		let proposal = match proposal {
			Some(p) => p,
			None => {
				trace!("No payjoin proposal yet for send session {}", id);
				return Ok(PassOutcome::Idle);
			},
		};

		let processed = self.wallet.process_psbt(&proposal.to_string(), true, true, &self.wallet_name).await
			.context("failed to sign payjoin proposal")?;
		if !processed.complete {
			return Ok(PassOutcome::Stalled("signed payjoin psbt is incomplete".into()));
		}
		let finalized = self.wallet.finalize_psbt(&processed.psbt).await
			.context("failed to finalize payjoin psbt")?;
		let tx_hex = match finalized.hex {
			Some(hex) if finalized.complete => hex,
			_ => return Ok(PassOutcome::Stalled("finalized payjoin psbt has no tx".into())),
		};

		let txid = self.wallet.send_raw_transaction(&tx_hex, &self.wallet_name).await
			.context("failed to broadcast payjoin tx")?;

		let decoded = self.wallet.decode_psbt(&processed.psbt).await
			.context("failed to decode payjoin psbt")?;
		let owned = self.owned_addresses(&decoded).await?;
		let amounts = fees::reconcile_sender_amounts(&decoded, &owned, session.amount)?;

		session.txid = Some(txid);
		session.fee = Some(amounts.total_fee);
		session.sender_fee = Some(amounts.sender_fee);
		slog!(SendProposalBroadcast, id, txid, fee: amounts.total_fee, sender_fee: amounts.sender_fee);
		Ok(PassOutcome::Completed(txid))
	}

	/// Check the reply mailbox for the payjoin proposal.
	async fn poll(&self, sender: &Sender<V2GetContext>, log: &SenderLog) -> anyhow::Result<Option<Psbt>> {
		let (req, ctx) = sender.create_poll_request(self.directory.relay.clone())
			.map_err(|e| anyhow!("failed to create poll request: {}", e))?;
		let res = self.transport.send(&req).await
			.context("failed to poll the reply mailbox")?;
		match sender.process_response(&res, ctx).save(log) {
			Ok(OptionalTransitionOutcome::Progress(psbt)) => Ok(Some(psbt)),
			Ok(OptionalTransitionOutcome::Stasis(_)) => Ok(None),
			Err(e) => Err(anyhow!("receiver didn't send a valid proposal: {}", e)),
		}
	}

	/// The addresses in the psbt that belong to our wallet.
	async fn owned_addresses(&self, psbt: &DecodedPsbt) -> anyhow::Result<HashSet<String>> {
		let addresses = psbt.inputs.iter()
			.filter_map(|i| i.witness_utxo.as_ref())
			.filter_map(|u| u.script_pubkey.address.as_ref())
			.chain(psbt.outputs().iter().filter_map(|o| o.script_pubkey.address.as_ref()))
			.collect::<HashSet<_>>();

		let mut owned = HashSet::with_capacity(addresses.len());
		for addr in addresses {
			let info = self.wallet.get_address_info(addr, &self.wallet_name).await
				.with_context(|| format!("failed to look up address {}", addr))?;
			if info.ismine {
				owned.insert(addr.clone());
			}
		}
		Ok(owned)
	}
}
