//! The operations behind the user-facing commands.
//!
//! Sessions are created, cancelled and queried here, and the address and
//! transaction watch events of the node arrive here. Everything that mutates
//! a session takes the same locks the reconcilers take.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{Address, Amount, FeeRate, Network, Psbt, Txid};
use bitcoin::address::NetworkUnchecked;
use chrono::{DateTime, Utc};
use payjoin::receive::v2::ReceiverBuilder;
use payjoin::send::v2::SenderBuilder;

use crate::config::Config;
use crate::database::model::{NewReceiveSession, NewSendSession, ReceiveSession, SendSession};
use crate::error::ContextExt;
use crate::lock::{address_key, session_key, Locker};
use crate::protocol::{parse_pj_uri, Directory, ReceiverLog, SenderLog};
use crate::receiver::RECEIVE;
use crate::repository::SessionRepository;
use crate::sender::SEND;
use crate::wallet::WalletGateway;


/// Confirmation target of the fee rate of our original transactions.
const SEND_FEE_RATE_TARGET: u16 = 6;
/// The lowest fee rate we accept for a payjoin we send.
const SEND_MIN_FEE_RATE: FeeRate = FeeRate::BROADCAST_MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReceiveStatus {
	Pending,
	Fallback,
	NonPayjoin,
	Unconfirmed,
	Confirmed,
	Expired,
	Cancelled,
}

impl ReceiveStatus {
	pub fn of(s: &ReceiveSession, now: DateTime<Utc>) -> ReceiveStatus {
		if s.txid.is_none() && s.confirmed_at.is_none() && s.is_expired(now) {
			ReceiveStatus::Expired
		} else if s.confirmed_at.is_some() {
			ReceiveStatus::Confirmed
		} else if s.fallback_at.is_some() {
			ReceiveStatus::Fallback
		} else if s.non_payjoin_at.is_some() {
			ReceiveStatus::NonPayjoin
		} else if s.txid.is_some() {
			ReceiveStatus::Unconfirmed
		} else if s.cancelled_at.is_some() {
			ReceiveStatus::Cancelled
		} else {
			ReceiveStatus::Pending
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SendStatus {
	Pending,
	Unconfirmed,
	Confirmed,
	Expired,
	Cancelled,
}

impl SendStatus {
	pub fn of(s: &SendSession, now: DateTime<Utc>) -> SendStatus {
		if s.txid.is_none() && s.confirmed_at.is_none() && s.is_expired(now) {
			SendStatus::Expired
		} else if s.confirmed_at.is_some() {
			SendStatus::Confirmed
		} else if s.txid.is_some() {
			SendStatus::Unconfirmed
		} else if s.cancelled_at.is_some() {
			SendStatus::Cancelled
		} else {
			SendStatus::Pending
		}
	}
}

/// A receive session as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveInfo {
	pub id: i64,
	pub address: String,
	pub bip21: String,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub status: ReceiveStatus,
	pub expiry_at: DateTime<Utc>,
	pub txid: Option<Txid>,
	#[serde(with = "bitcoin::amount::serde::as_sat::opt")]
	pub fee: Option<Amount>,
	#[serde(with = "bitcoin::amount::serde::as_sat::opt")]
	pub receiver_fee: Option<bitcoin::SignedAmount>,
}

impl ReceiveInfo {
	pub fn new(s: &ReceiveSession, now: DateTime<Utc>) -> ReceiveInfo {
		ReceiveInfo {
			id: s.id,
			address: s.address.clone(),
			bip21: s.bip21.clone(),
			amount: s.amount,
			status: ReceiveStatus::of(s, now),
			expiry_at: s.expiry_at,
			txid: s.txid,
			fee: s.fee,
			receiver_fee: s.receiver_fee,
		}
	}
}

/// A send session as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendInfo {
	pub id: i64,
	pub address: String,
	pub bip21: String,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub status: SendStatus,
	pub expiry_at: DateTime<Utc>,
	pub txid: Option<Txid>,
	#[serde(with = "bitcoin::amount::serde::as_sat::opt")]
	pub fee: Option<Amount>,
	#[serde(with = "bitcoin::amount::serde::as_sat::opt")]
	pub sender_fee: Option<bitcoin::SignedAmount>,
}

impl SendInfo {
	pub fn new(s: &SendSession, now: DateTime<Utc>) -> SendInfo {
		SendInfo {
			id: s.id,
			address: s.address.clone(),
			bip21: s.bip21.clone(),
			amount: s.amount,
			status: SendStatus::of(s, now),
			expiry_at: s.expiry_at,
			txid: s.txid,
			fee: s.fee,
			sender_fee: s.sender_fee,
		}
	}
}

/// What we post to a session's callback url.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
	pub id: i64,
	pub address: String,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub txid: Txid,
	pub confirmations: u32,
}

/// Delivery of session callbacks.
#[async_trait]
pub trait Callbacks: Send + Sync + 'static {
	async fn post(&self, url: &str, payload: &CallbackPayload) -> anyhow::Result<()>;
}

pub struct HttpCallbacks {
	client: reqwest::Client,
}

impl HttpCallbacks {
	pub fn new(timeout: Duration) -> anyhow::Result<HttpCallbacks> {
		let client = reqwest::Client::builder().timeout(timeout).build()
			.context("failed to build http client")?;
		Ok(HttpCallbacks { client })
	}
}

#[async_trait]
impl Callbacks for HttpCallbacks {
	async fn post(&self, url: &str, payload: &CallbackPayload) -> anyhow::Result<()> {
		self.client.post(url).json(payload).send().await
			.with_context(|| format!("callback to {} failed", url))?
			.error_for_status()
			.with_context(|| format!("callback to {} was refused", url))?;
		Ok(())
	}
}

pub struct SessionService {
	repo: Arc<dyn SessionRepository>,
	wallet: Arc<dyn WalletGateway>,
	locker: Locker,
	directory: Arc<Directory>,
	callbacks: Arc<dyn Callbacks>,

	network: Network,
	receive_wallet: String,
	send_wallet: String,
	payjoin_expiry: Duration,
}

impl SessionService {
	pub fn new(
		cfg: &Config,
		repo: Arc<dyn SessionRepository>,
		wallet: Arc<dyn WalletGateway>,
		locker: Locker,
		directory: Arc<Directory>,
		callbacks: Arc<dyn Callbacks>,
	) -> SessionService {
		SessionService {
			repo,
			wallet,
			locker,
			directory,
			callbacks,
			network: cfg.network,
			receive_wallet: cfg.receive_wallet.clone(),
			send_wallet: cfg.send_wallet.clone(),
			payjoin_expiry: cfg.payjoin_expiry,
		}
	}

	fn expiry(&self, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
		Ok(now + chrono::Duration::from_std(self.payjoin_expiry).context("payjoin expiry out of range")?)
	}

	fn check_address(&self, address: &str) -> anyhow::Result<Address> {
		Address::<NetworkUnchecked>::from_str(address)
			.badarg(format!("invalid address: {}", address))?
			.require_network(self.network)
			.badarg(format!("address {} is not for network {}", address, self.network))
	}

	/**
	 * Receive sessions
	*/

	/// Start receiving `amount` on `address`, or on a new address of the
	/// receive wallet.
	pub async fn receive(
		&self,
		address: Option<&str>,
		amount: Amount,
		callback_url: Option<String>,
	) -> anyhow::Result<ReceiveSession> {
		if amount == Amount::ZERO {
			return badarg!("amount must be positive");
		}
		let address = match address {
			Some(a) => self.check_address(a)?,
			None => {
				let new = self.wallet.get_new_address(&self.receive_wallet).await
					.context("failed to get a new address")?;
				self.check_address(&new).context("wallet returned a bad address")?
			},
		};

		let expiry_at = self.expiry(Utc::now())?;
		let ohttp_keys = self.directory.ohttp_keys().await?;
		let log = ReceiverLog::new();
		let receiver = ReceiverBuilder::new(address.clone(), self.directory.url.clone(), ohttp_keys)
			.map_err(|e| anyhow!("invalid payjoin directory {}: {}", self.directory.url, e))?
			.with_amount(amount)
			.with_expiration(self.payjoin_expiry)
			.build()
			.save(&log)
			.map_err(|e| anyhow!("failed to start the payjoin receiver: {}", e))?;
		let bip21 = receiver.pj_uri().to_string();
		let session = self.repo.create_receive_session(NewReceiveSession {
			address: address.to_string(),
			bip21: bip21.clone(),
			amount,
			session: log.to_json()?,
			callback_url,
			expiry_at,
		}).await.context("failed to store receive session")?;

		slog!(ReceiveSessionCreated, id: session.id, address: session.address.clone(), amount, bip21);
		Ok(session)
	}

	pub async fn get_receive(&self, id: i64) -> anyhow::Result<ReceiveInfo> {
		let session = self.repo.get_receive_session(id).await?
			.not_found([id], "receive session")?;
		Ok(ReceiveInfo::new(&session, Utc::now()))
	}

	pub async fn cancel_receive(&self, id: i64) -> anyhow::Result<ReceiveSession> {
		self.locker.with_lock([session_key(RECEIVE, id)], async {
			let mut session = self.repo.get_receive_session(id).await?
				.not_found([id], "receive session")?;

			let now = Utc::now();
			if session.confirmed_at.is_some() {
				return invalid_state!(id, "is confirmed");
			}
			if session.txid.is_some() {
				return invalid_state!(id, "already has a transaction");
			}
			if session.is_expired(now) {
				return invalid_state!(id, "is expired");
			}
			if session.cancelled_at.is_some() {
				return invalid_state!(id, "is already cancelled");
			}

			session.cancelled_at = Some(now);
			self.repo.update_receive_session(&session).await?;
			slog!(SessionCancelled, id, kind: RECEIVE.into());
			Ok(session)
		}).await
	}

	/**
	 * Send sessions
	*/

	/// Start paying a payjoin-enabled bip21 uri.
	pub async fn send(&self, bip21: &str, callback_url: Option<String>) -> anyhow::Result<SendSession> {
		let uri = parse_pj_uri(bip21).badarg(format!("not a payjoin uri: {}", bip21))?;
		let amount = match uri.amount {
			Some(a) if a > Amount::ZERO => a,
			_ => return badarg!("bip21 uri has no amount"),
		};
		let address = self.check_address(&uri.address.to_string())?;

		let fee_rate = self.wallet.get_fee_rate(SEND_FEE_RATE_TARGET).await
			.context("failed to get fee rate")?;
		let funded = self.wallet.create_funded_psbt(
			&self.send_wallet, &address.to_string(), amount, fee_rate,
		).await.context("failed to fund the original psbt")?;
		let signed = self.wallet.process_psbt(&funded, true, true, &self.send_wallet).await
			.context("failed to sign the original psbt")?;
		ensure!(signed.complete, "wallet couldn't sign the original psbt");
		let original = signed.psbt.parse::<Psbt>().context("wallet returned an invalid psbt")?;

		let log = SenderLog::new();
		SenderBuilder::new(original, uri)
			.build_recommended(SEND_MIN_FEE_RATE)
			.save(&log)
			.map_err(|e| anyhow!("can't build a payjoin request from the original psbt: {}", e))?;
		let session = self.repo.create_send_session(NewSendSession {
			address: address.to_string(),
			bip21: bip21.to_owned(),
			amount,
			session: log.to_json()?,
			callback_url,
			expiry_at: self.expiry(Utc::now())?,
		}).await.context("failed to store send session")?;

		slog!(SendSessionCreated, id: session.id, address: session.address.clone(), amount);
		Ok(session)
	}

	pub async fn get_send(&self, id: i64) -> anyhow::Result<SendInfo> {
		let session = self.repo.get_send_session(id).await?
			.not_found([id], "send session")?;
		Ok(SendInfo::new(&session, Utc::now()))
	}

	pub async fn cancel_send(&self, id: i64) -> anyhow::Result<SendSession> {
		self.locker.with_lock([session_key(SEND, id)], async {
			let mut session = self.repo.get_send_session(id).await?
				.not_found([id], "send session")?;

			let now = Utc::now();
			if session.confirmed_at.is_some() {
				return invalid_state!(id, "is confirmed");
			}
			if session.txid.is_some() {
				return invalid_state!(id, "already has a transaction");
			}
			if session.is_expired(now) {
				return invalid_state!(id, "is expired");
			}
			if session.cancelled_at.is_some() {
				return invalid_state!(id, "is already cancelled");
			}

			session.cancelled_at = Some(now);
			self.repo.update_send_session(&session).await?;
			slog!(SessionCancelled, id, kind: SEND.into());
			Ok(session)
		}).await
	}

	/**
	 * Watch events
	*/

	/// A transaction paying a watched address was seen.
	pub async fn handle_address_event(
		&self,
		address: &str,
		txid: Txid,
		confirmations: u32,
	) -> anyhow::Result<ReceiveSession> {
		self.locker.with_lock([address_key(address)], async {
			let mut session = self.repo.get_receive_session_by_address(address).await?
				.not_found([address], "receive session for address")?;
			slog!(SessionTxSeen, id: session.id, kind: RECEIVE.into(), txid, confirmations);

			let now = Utc::now();
			if session.txid.is_none() {
				info!("Receive session {} got paid without payjoin in tx {}", session.id, txid);
				session.txid = Some(txid);
				session.non_payjoin_at = Some(now);
			}
			if confirmations >= 1 && session.confirmed_at.is_none() {
				session.confirmed_at = Some(now);
			}

			if let Some(ref url) = session.callback_url {
				if session.called_back_at.is_none() {
					let payload = CallbackPayload {
						id: session.id,
						address: session.address.clone(),
						amount: session.amount,
						txid,
						confirmations,
					};
					if self.call_back(url, &payload).await {
						session.called_back_at = Some(now);
					}
				}
			}

			self.repo.update_receive_session(&session).await?;
			Ok(session)
		}).await
	}

	/// A transaction of a send session got confirmations.
	pub async fn handle_tx_event(&self, txid: Txid, confirmations: u32) -> anyhow::Result<SendSession> {
		let id = self.repo.get_send_session_by_txid(txid).await?
			.not_found([txid], "send session for tx")?.id;

		self.locker.with_lock([session_key(SEND, id)], async {
			let mut session = self.repo.get_send_session(id).await?
				.not_found([id], "send session")?;
			slog!(SessionTxSeen, id: session.id, kind: SEND.into(), txid, confirmations);

			let now = Utc::now();
			if confirmations >= 1 && session.confirmed_at.is_none() {
				session.confirmed_at = Some(now);
			}

			if let Some(ref url) = session.callback_url {
				if session.called_back_at.is_none() {
					let payload = CallbackPayload {
						id: session.id,
						address: session.address.clone(),
						amount: session.amount,
						txid,
						confirmations,
					};
					if self.call_back(url, &payload).await {
						session.called_back_at = Some(now);
					}
				}
			}

			self.repo.update_send_session(&session).await?;
			Ok(session)
		}).await
	}

	/// Returns whether the callback was delivered.
	async fn call_back(&self, url: &str, payload: &CallbackPayload) -> bool {
		match self.callbacks.post(url, payload).await {
			Ok(()) => {
				slog!(CallbackDelivered, id: payload.id, url: url.to_owned(), txid: payload.txid);
				true
			},
			Err(e) => {
				slog!(CallbackFailed, id: payload.id, url: url.to_owned(), error: format!("{:#}", e));
				false
			},
		}
	}
}
