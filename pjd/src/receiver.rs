//! Drives receive sessions through the payjoin receiver state machine.
//!
//! A pass replays the stored event log of the session, polls the directory
//! and takes the original proposal through every check up to a posted
//! payjoin proposal. The events of a pass are only written back once it ran
//! to a conclusion, so a pass that stalls or errors is re-run on the next
//! tick from the last stored state.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{psbt, OutPoint, Psbt, Script, ScriptBuf, Transaction, TxIn, TxOut, Txid};
use bitcoin::consensus::encode::serialize_hex;
use chrono::{DateTime, Utc};
use payjoin::persist::{OptionalTransitionOutcome, PersistedError};
use payjoin::receive::InputPair;
use payjoin::receive::v2::{
	replay_event_log, HasReplyableError, Initialized, ReceiveSession as SessionState, Receiver,
	UncheckedOriginalPayload,
};

use crate::config::Config;
use crate::database::model::ReceiveSession;
use crate::fees::{self, btc_to_sat};
use crate::lock::{address_key, session_key, LockTimeout, Locker};
use crate::protocol::{callback_error, Directory, ReceiverLog, Transport};
use crate::repository::{Partition, SessionRepository};
use crate::seen::SeenInputCache;
use crate::wallet::{SyncWalletGateway, WalletGateway};


/// Confirmation target of the fee rate the original must at least pay.
const MIN_FEE_RATE_TARGET: u16 = 6;
/// Confirmation target of the highest fee rate we pay for our contribution.
const MAX_FEE_RATE_TARGET: u16 = 1;

pub const RECEIVE: &str = "receive";

/// The checks an original proposal goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverStage {
	BroadcastSuitability,
	InputOwnership,
	SeenInputs,
	ReceiverOutputs,
	FeeRange,
	Finalization,
}

impl fmt::Display for ReceiverStage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			ReceiverStage::BroadcastSuitability => "broadcast_suitability",
			ReceiverStage::InputOwnership => "input_ownership",
			ReceiverStage::SeenInputs => "seen_inputs",
			ReceiverStage::ReceiverOutputs => "receiver_outputs",
			ReceiverStage::FeeRange => "fee_range",
			ReceiverStage::Finalization => "finalization",
		})
	}
}

/// How a reconciliation pass ended.
#[derive(Debug)]
pub enum PassOutcome {
	/// Nothing to do, the counterparty hasn't acted yet.
	Idle,
	/// A check found the proposal unacceptable.
	Rejected {
		stage: ReceiverStage,
		error: String,
	},
	/// The pass stopped early at a point that may resolve by itself.
	Stalled(String),
	Completed(Txid),
	/// The pass hit an error.
	Failed(anyhow::Error),
}

impl PassOutcome {
	pub fn is_completed(&self) -> bool {
		matches!(self, PassOutcome::Completed(_))
	}
}

/// Whether a failed check is down to us instead of the proposal.
trait OnOurSide {
	fn on_our_side(&self) -> bool;
}

impl OnOurSide for payjoin::receive::Error {
	fn on_our_side(&self) -> bool {
		matches!(self, payjoin::receive::Error::Implementation(_))
	}
}

impl OnOurSide for payjoin::receive::ProtocolError {
	fn on_our_side(&self) -> bool {
		false
	}
}

impl OnOurSide for payjoin::ImplementationError {
	fn on_our_side(&self) -> bool {
		true
	}
}

/// Split the result of a check into the next state or the end of the pass.
fn gate<T, E, S>(
	stage: ReceiverStage,
	res: Result<T, PersistedError<E, Infallible, S>>,
) -> anyhow::Result<Result<T, PassOutcome>>
where
	E: std::error::Error + OnOurSide,
	S: fmt::Debug,
{
	let err = match res {
		Ok(next) => return Ok(Ok(next)),
		Err(e) => e,
	};
	match err.api_error_ref() {
		Some(e) if e.on_our_side() => Err(anyhow!("{} check failed: {}", stage, e)),
		Some(e) => Ok(Err(PassOutcome::Rejected { stage, error: e.to_string() })),
		None => Err(anyhow!("failed to store session event at {}", stage)),
	}
}

/// Early-return the pass outcome of a check.
macro_rules! passed {
	($stage:expr, $res:expr $(,)?) => {
		match gate($stage, $res)? {
			Ok(next) => next,
			Err(outcome) => return Ok(outcome),
		}
	};
}

pub struct ReceiverReconciler {
	repo: Arc<dyn SessionRepository>,
	wallet: Arc<dyn WalletGateway>,
	sync_wallet: Arc<dyn SyncWalletGateway>,
	transport: Arc<dyn Transport>,
	directory: Arc<Directory>,
	locker: Locker,
	seen: Arc<SeenInputCache>,

	wallet_name: String,
	max_input_candidates: usize,
	fallback_delay: Duration,
}

impl ReceiverReconciler {
	pub fn new(
		cfg: &Config,
		repo: Arc<dyn SessionRepository>,
		wallet: Arc<dyn WalletGateway>,
		sync_wallet: Arc<dyn SyncWalletGateway>,
		transport: Arc<dyn Transport>,
		directory: Arc<Directory>,
		locker: Locker,
		seen: Arc<SeenInputCache>,
	) -> ReceiverReconciler {
		ReceiverReconciler {
			repo,
			wallet,
			sync_wallet,
			transport,
			directory,
			locker,
			seen,
			wallet_name: cfg.receive_wallet.clone(),
			max_input_candidates: cfg.max_input_candidates,
			fallback_delay: cfg.fallback_delay,
		}
	}

	/// Run one pass on the session. Never fails, errors end up in the outcome.
	pub async fn reconcile(&self, id: i64, now: DateTime<Utc>) -> PassOutcome {
		let outcome = match self.try_reconcile(id, now).await {
			Ok(o) => o,
			Err(e) => PassOutcome::Failed(e),
		};

		match outcome {
			PassOutcome::Rejected { ref stage, ref error } => {
				slog!(ReceiveGateRejected, id, stage: stage.to_string(), error: error.clone());
				self.mark_failed(id, now).await;
			},
			PassOutcome::Failed(ref e) if e.downcast_ref::<LockTimeout>().is_some() => {
				debug!("Receive session {} is busy: {:#}", id, e);
			},
			PassOutcome::Failed(ref e) => {
				slog!(ReceiveSessionFailed, id, error: format!("{:#}", e));
				self.mark_failed(id, now).await;
			},
			PassOutcome::Stalled(ref reason) => {
				slog!(ReceiveSessionStalled, id, reason: reason.clone());
			},
			PassOutcome::Idle | PassOutcome::Completed(_) => {},
		}
		outcome
	}

	async fn mark_failed(&self, id: i64, now: DateTime<Utc>) {
		if let Err(e) = self.repo.mark_receive_failed(id, now).await {
			error!("Failed to mark receive session {} as failed: {:#}", id, e);
		}
	}

	async fn try_reconcile(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<PassOutcome> {
		let session = self.repo.get_receive_session(id).await?
			.with_context(|| format!("receive session {} not found", id))?;
		if session.txid.is_some() {
			return Ok(PassOutcome::Idle);
		}

		let keys = [session_key(RECEIVE, id), address_key(&session.address)];
		self.locker.with_lock(keys, self.locked_pass(id, now)).await
	}

	/// Run `f` with the sync wallet on the blocking pool.
	async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
	where
		T: Send + 'static,
		F: FnOnce(Arc<dyn SyncWalletGateway>) -> T + Send + 'static,
	{
		let wallet = self.sync_wallet.clone();
		tokio::task::spawn_blocking(move || f(wallet)).await.context("check task panicked")
	}

	async fn locked_pass(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<PassOutcome> {
		// might have changed while we waited for the lock
		let mut session = self.repo.get_receive_session(id).await?
			.with_context(|| format!("receive session {} not found", id))?;
		if !session.is_active(now) {
			return Ok(PassOutcome::Idle);
		}

		let log = ReceiverLog::from_json(&session.session)?;
		let nb_events = log.len();
		let outcome = self.negotiate(&mut session, &log, now).await?;

		let concluded = !matches!(outcome, PassOutcome::Stalled(_));
		if concluded && (log.len() != nb_events || outcome.is_completed()) {
			session.session = log.to_json()?;
			self.repo.update_receive_session(&session).await?;
		}
		Ok(outcome)
	}

	async fn negotiate(
		&self,
		session: &mut ReceiveSession,
		log: &ReceiverLog,
		now: DateTime<Utc>,
	) -> anyhow::Result<PassOutcome> {
		let id = session.id;
		let (state, _history) = replay_event_log(log)
			.map_err(|e| anyhow!("failed to replay receive session: {}", e))?;
		let proposal = match state {
			SessionState::Initialized(receiver) => match self.poll(receiver, log).await? {
				Some(p) => p,
				None => {
					trace!("No proposal yet for receive session {}", id);
					return Ok(PassOutcome::Idle);
				},
			},
			SessionState::UncheckedOriginalPayload(p) => p,
			SessionState::HasReplyableError(receiver) => {
				self.reply_error(receiver, log).await?;
				debug!("Sent the rejection of receive session {} to the sender", id);
				return Ok(PassOutcome::Idle);
			},
			SessionState::Monitor(_) | SessionState::Closed(_) => return Ok(PassOutcome::Idle),
			_ => bail!("receive session {} was stored halfway a negotiation", id),
		};
		if session.first_seen_at.is_none() {
			session.first_seen_at = Some(now);
			self.repo.update_receive_session(session).await?;
		}

		let min_fee_rate = self.wallet.get_fee_rate(MIN_FEE_RATE_TARGET).await
			.context("failed to get minimum fee rate")?;

		let l = log.clone();
		let res = self.blocking(move |w| {
			proposal.check_broadcast_suitability(Some(min_fee_rate), |tx: &Transaction| {
				let res = w.test_mempool_accept(&serialize_hex(tx)).map_err(callback_error)?;
				Ok(res.first().map(|r| r.allowed).unwrap_or(false))
			}).save(&l)
		}).await?;
		let proposal = passed!(ReceiverStage::BroadcastSuitability, res);

		let original_tx = proposal.extract_tx_to_schedule_broadcast();
		let original_txid = original_tx.compute_txid();
		let original_hex = serialize_hex(&original_tx);
		slog!(ReceiveProposalReceived, id, original_txid, nb_inputs: original_tx.input.len());
		if session.fallback_tx_hex.is_none() {
			session.fallback_tx_hex = Some(original_hex.clone());
			self.repo.update_receive_session(session).await?;
			slog!(FallbackTxStored, id, txid: original_txid);
		}

		let original = match self.wallet.decode_raw_transaction(&original_hex).await {
			Ok(tx) => tx,
			Err(e) => return Ok(PassOutcome::Stalled(
				format!("failed to decode original tx {}: {:#}", original_txid, e),
			)),
		};
		let receiver_scripts = original.vout.iter()
			.filter(|o| o.script_pubkey.address.as_deref() == Some(session.address.as_str()))
			.map(|o| o.script_pubkey.script())
			.collect::<anyhow::Result<Vec<ScriptBuf>>>()?;

		let (l, wallet_name) = (log.clone(), self.wallet_name.clone());
		let res = self.blocking(move |w| {
			proposal.check_inputs_not_owned(&mut |script: &Script| {
				let info = w.decode_script(script).map_err(callback_error)?;
				match info.address {
					Some(addr) => Ok(w.get_address_info(&addr, &wallet_name).map_err(callback_error)?.ismine),
					None => Ok(false),
				}
			}).save(&l)
		}).await?;
		let proposal = passed!(ReceiverStage::InputOwnership, res);

		self.seen.refresh_in_background();
		let res = proposal.check_no_inputs_seen_before(&mut |outpoint: &OutPoint| {
			let known = self.seen.is_known(outpoint, &session.bip21);
			self.seen.record_new_input(*outpoint);
			Ok(known)
		}).save(log);
		self.seen.flush(&session.bip21).await?;
		let proposal = passed!(ReceiverStage::SeenInputs, res);

		let proposal = passed!(ReceiverStage::ReceiverOutputs,
			proposal.identify_receiver_outputs(&mut |script: &Script| {
				Ok(receiver_scripts.iter().any(|r| r.as_script() == script))
			}).save(log),
		);
		let proposal = proposal.commit_outputs().save(log)?;

		let candidates = self.input_candidates().await?;
		if candidates.is_empty() {
			error!("No inputs available to contribute to receive session {}", id);
			return Ok(PassOutcome::Stalled("no inputs available".into()));
		}
		let candidate_scripts = candidates.iter().map(|(_, txout)| txout.script_pubkey.clone())
			.collect::<Vec<_>>();
		let pairs = candidates.into_iter().filter_map(|(outpoint, txout)| {
			let txin = TxIn { previous_output: outpoint, ..Default::default() };
			let psbtin = psbt::Input { witness_utxo: Some(txout), ..Default::default() };
			match InputPair::new(txin, psbtin, None) {
				Ok(pair) => Some(pair),
				Err(e) => {
					trace!("Skipping utxo {}: {}", outpoint, e);
					None
				},
			}
		}).collect::<Vec<_>>();
		let selected = match proposal.try_preserving_privacy(pairs) {
			Ok(input) => input,
			Err(e) => return Ok(PassOutcome::Stalled(format!("no input to contribute: {}", e))),
		};
		debug!("Contributing an input to receive session {}", id);
		let proposal = proposal.contribute_inputs(vec![selected])
			.map_err(|e| anyhow!("failed to contribute our input: {}", e))?
			.commit_inputs().save(log)?;

		let max_fee_rate = self.wallet.get_fee_rate(MAX_FEE_RATE_TARGET).await
			.context("failed to get maximum fee rate")?;
		let proposal = passed!(ReceiverStage::FeeRange,
			proposal.apply_fee_range(Some(min_fee_rate), Some(max_fee_rate)).save(log),
		);

		let (l, wallet_name) = (log.clone(), self.wallet_name.clone());
		let res = self.blocking(move |w| {
			proposal.finalize_proposal(|psbt: &Psbt| {
				let processed = w.process_psbt(&psbt.to_string(), true, true, &wallet_name)
					.map_err(callback_error)?;
				processed.psbt.parse::<Psbt>()
					.map_err(|e| callback_error(anyhow!("wallet returned an invalid psbt: {}", e)))
			}).save(&l)
		}).await?;
		let proposal = passed!(ReceiverStage::Finalization, res);

		// one by one, so that one bad utxo doesn't leave the others unlocked
		let to_lock = proposal.utxos_to_be_locked().copied().collect::<Vec<_>>();
		for outpoint in to_lock {
			match self.wallet.lock_unspent(&[outpoint], &self.wallet_name).await {
				Ok(true) => {},
				Ok(false) => slog!(UtxoLockFailed, outpoint, error: "wallet refused the lock".into()),
				Err(e) => slog!(UtxoLockFailed, outpoint, error: format!("{:#}", e)),
			}
		}

		let (req, ctx) = proposal.clone().create_post_request(self.directory.relay.clone())
			.map_err(|e| anyhow!("failed to create proposal request: {}", e))?;
		let res = self.transport.send(&req).await
			.context("failed to submit payjoin proposal")?;
		proposal.clone().process_response(&res, ctx).save(log)
			.map_err(|e| anyhow!("directory refused the payjoin proposal: {}", e))?;

		let payjoin = proposal.psbt();
		let txid = payjoin.unsigned_tx.compute_txid();
		let decoded = self.wallet.decode_psbt(&payjoin.to_string()).await
			.context("failed to decode payjoin psbt")?;
		let amounts = fees::reconcile_receiver_amounts(
			&decoded, &candidate_scripts, &session.address, session.amount,
		)?;
		if amounts.within_tolerance {
			info!("Receive session {} settled at the requested amount {}", id, session.amount);
		} else {
			slog!(AmountMismatch, id, requested: session.amount, calculated: amounts.settled_amount);
		}

		session.txid = Some(txid);
		session.amount = amounts.settled_amount;
		session.fee = Some(amounts.total_fee);
		session.receiver_fee = Some(amounts.receiver_fee);
		session.receiver_in_amount = Some(amounts.receiver_in_amount);
		session.receiver_out_amount = Some(amounts.receiver_out_amount);
		slog!(ReceiveProposalSubmitted, id, txid, fee: amounts.total_fee,
			receiver_fee: amounts.receiver_fee,
		);

		Ok(PassOutcome::Completed(txid))
	}

	/// Ask the directory for the original proposal.
	async fn poll(
		&self,
		receiver: Receiver<Initialized>,
		log: &ReceiverLog,
	) -> anyhow::Result<Option<Receiver<UncheckedOriginalPayload>>> {
		let (req, ctx) = receiver.create_poll_request(self.directory.relay.clone())
			.map_err(|e| anyhow!("failed to create poll request: {}", e))?;
		let res = self.transport.send(&req).await
			.context("failed to poll the payjoin directory")?;
		match receiver.process_response(&res, ctx).save(log) {
			Ok(OptionalTransitionOutcome::Progress(proposal)) => Ok(Some(proposal)),
			Ok(OptionalTransitionOutcome::Stasis(_)) => Ok(None),
			Err(e) => Err(anyhow!("invalid response from the payjoin directory: {}", e)),
		}
	}

	/// Tell the sender why we rejected its proposal.
	async fn reply_error(
		&self,
		receiver: Receiver<HasReplyableError>,
		log: &ReceiverLog,
	) -> anyhow::Result<()> {
		let (req, ctx) = receiver.clone().create_error_request(self.directory.relay.clone())
			.map_err(|e| anyhow!("failed to create error reply: {}", e))?;
		let res = self.transport.send(&req).await
			.context("failed to post the error reply")?;
		receiver.process_error_response(&res, ctx).save(log)
			.map_err(|e| anyhow!("directory refused the error reply: {}", e))?;
		Ok(())
	}

	/// Our confirmed utxos, smallest first.
	async fn input_candidates(&self) -> anyhow::Result<Vec<(OutPoint, TxOut)>> {
		let utxos = self.wallet.list_unspent(&self.wallet_name, 1).await
			.context("failed to list unspent outputs")?;

		let mut candidates = Vec::with_capacity(utxos.len());
		for utxo in utxos.into_iter().filter(|u| u.spendable && u.safe) {
			let txout = TxOut {
				value: btc_to_sat(utxo.amount)?,
				script_pubkey: ScriptBuf::from_hex(&utxo.script_pubkey)
					.with_context(|| format!("invalid script for utxo {}", utxo.outpoint()))?,
			};
			candidates.push((utxo.outpoint(), txout));
		}
		candidates.sort_by_key(|(_, txout)| txout.value);
		candidates.truncate(self.max_input_candidates);
		Ok(candidates)
	}

	/// Broadcast the fallback tx of every session that failed longer than
	/// the fallback delay ago. Returns the number of broadcast txs.
	pub async fn sweep_fallbacks(&self, partition: Partition, now: DateTime<Utc>) -> anyhow::Result<usize> {
		let delay = chrono::Duration::from_std(self.fallback_delay)
			.context("fallback delay out of range")?;
		let candidates = self.repo.list_fallback_candidates(partition, now - delay).await?;

		let mut count = 0;
		for session in candidates {
			let keys = [session_key(RECEIVE, session.id), address_key(&session.address)];
			match self.locker.with_lock(keys, self.broadcast_fallback(session.id, now)).await {
				Ok(Some(_)) => count += 1,
				Ok(None) => {},
				Err(e) => slog!(FallbackBroadcastFailed, id: session.id, error: format!("{:#}", e)),
			}
		}
		Ok(count)
	}

	async fn broadcast_fallback(&self, id: i64, now: DateTime<Utc>) -> anyhow::Result<Option<Txid>> {
		let mut session: ReceiveSession = self.repo.get_receive_session(id).await?
			.with_context(|| format!("receive session {} not found", id))?;
		if session.txid.is_some() || session.cancelled_at.is_some() {
			return Ok(None);
		}
		let tx_hex = match session.fallback_tx_hex {
			Some(ref hex) => hex.clone(),
			None => return Ok(None),
		};

		let txid = self.wallet.send_raw_transaction(&tx_hex, &self.wallet_name).await
			.context("failed to broadcast fallback tx")?;
		session.txid = Some(txid);
		session.fallback_at = Some(now);
		self.repo.update_receive_session(&session).await?;
		slog!(FallbackBroadcast, id, txid);
		Ok(Some(txid))
	}
}
