use std::str::FromStr;

use anyhow::Context;
use bitcoin::{Amount, OutPoint, SignedAmount, Txid};
use chrono::{DateTime, Utc};
use tokio_postgres::Row;


fn amount_from_sql(sat: i64) -> anyhow::Result<Amount> {
	Ok(Amount::from_sat(u64::try_from(sat).context("negative amount in database")?))
}

fn opt_amount(row: &Row, column: &str) -> anyhow::Result<Option<Amount>> {
	row.get::<_, Option<i64>>(column).map(amount_from_sql).transpose()
}

fn opt_signed_amount(row: &Row, column: &str) -> Option<SignedAmount> {
	row.get::<_, Option<i64>>(column).map(SignedAmount::from_sat)
}

fn opt_txid(row: &Row, column: &str) -> anyhow::Result<Option<Txid>> {
	row.get::<_, Option<&str>>(column).map(Txid::from_str).transpose()
		.with_context(|| format!("invalid txid in column {}", column))
}

/// A request to receive a payjoin payment on a watched address.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSession {
	pub id: i64,
	pub address: String,
	pub bip21: String,
	/// The amount the payer was asked to pay.
	pub amount: Amount,
	/// The JSON event log of the payjoin receiver.
	pub session: String,
	pub callback_url: Option<String>,
	pub expiry_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	/// When the original proposal was first received from the directory.
	pub first_seen_at: Option<DateTime<Utc>>,
	pub confirmed_at: Option<DateTime<Utc>>,
	pub cancelled_at: Option<DateTime<Utc>>,
	/// Set when a reconciliation pass failed, cleared never.
	pub failed_at: Option<DateTime<Utc>>,
	/// Set when the fallback tx was broadcast in place of the payjoin.
	pub fallback_at: Option<DateTime<Utc>>,
	/// Set when the address got paid by a regular transaction.
	pub non_payjoin_at: Option<DateTime<Utc>>,
	pub called_back_at: Option<DateTime<Utc>>,
	pub txid: Option<Txid>,
	/// The sender's original tx, stored once it passed the broadcast check.
	pub fallback_tx_hex: Option<String>,
	pub fee: Option<Amount>,
	pub receiver_fee: Option<SignedAmount>,
	pub receiver_in_amount: Option<Amount>,
	pub receiver_out_amount: Option<Amount>,
}

impl ReceiveSession {
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expiry_at <= now
	}

	/// Whether the session can still be reconciled.
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.txid.is_none() && self.confirmed_at.is_none() && self.cancelled_at.is_none()
			&& !self.is_expired(now)
	}
}

impl TryFrom<Row> for ReceiveSession {
	type Error = anyhow::Error;

	fn try_from(row: Row) -> Result<Self, Self::Error> {
		Ok(ReceiveSession {
			id: row.get("id"),
			address: row.get("address"),
			bip21: row.get("bip21"),
			amount: amount_from_sql(row.get("amount"))?,
			session: row.get("session"),
			callback_url: row.get("callback_url"),
			expiry_at: row.get("expiry_at"),
			created_at: row.get("created_at"),
			first_seen_at: row.get("first_seen_at"),
			confirmed_at: row.get("confirmed_at"),
			cancelled_at: row.get("cancelled_at"),
			failed_at: row.get("failed_at"),
			fallback_at: row.get("fallback_at"),
			non_payjoin_at: row.get("non_payjoin_at"),
			called_back_at: row.get("called_back_at"),
			txid: opt_txid(&row, "txid")?,
			fallback_tx_hex: row.get("fallback_tx_hex"),
			fee: opt_amount(&row, "fee")?,
			receiver_fee: opt_signed_amount(&row, "receiver_fee"),
			receiver_in_amount: opt_amount(&row, "receiver_in_amount")?,
			receiver_out_amount: opt_amount(&row, "receiver_out_amount")?,
		})
	}
}

/// The fields provided when creating a [ReceiveSession].
#[derive(Debug, Clone)]
pub struct NewReceiveSession {
	pub address: String,
	pub bip21: String,
	pub amount: Amount,
	pub session: String,
	pub callback_url: Option<String>,
	pub expiry_at: DateTime<Utc>,
}

/// A payment we are making to a payjoin-enabled bip21.
#[derive(Debug, Clone, PartialEq)]
pub struct SendSession {
	pub id: i64,
	pub address: String,
	pub bip21: String,
	pub amount: Amount,
	/// The JSON event log of the payjoin sender.
	pub session: String,
	pub callback_url: Option<String>,
	pub expiry_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	pub confirmed_at: Option<DateTime<Utc>>,
	pub cancelled_at: Option<DateTime<Utc>>,
	pub called_back_at: Option<DateTime<Utc>>,
	pub txid: Option<Txid>,
	pub fee: Option<Amount>,
	/// Only meaningful once [SendSession::txid] is set.
	pub sender_fee: Option<SignedAmount>,
}

impl SendSession {
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expiry_at <= now
	}

	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.txid.is_none() && self.confirmed_at.is_none() && self.cancelled_at.is_none()
			&& !self.is_expired(now)
	}
}

impl TryFrom<Row> for SendSession {
	type Error = anyhow::Error;

	fn try_from(row: Row) -> Result<Self, Self::Error> {
		Ok(SendSession {
			id: row.get("id"),
			address: row.get("address"),
			bip21: row.get("bip21"),
			amount: amount_from_sql(row.get("amount"))?,
			session: row.get("session"),
			callback_url: row.get("callback_url"),
			expiry_at: row.get("expiry_at"),
			created_at: row.get("created_at"),
			confirmed_at: row.get("confirmed_at"),
			cancelled_at: row.get("cancelled_at"),
			called_back_at: row.get("called_back_at"),
			txid: opt_txid(&row, "txid")?,
			fee: opt_amount(&row, "fee")?,
			sender_fee: opt_signed_amount(&row, "sender_fee"),
		})
	}
}

#[derive(Debug, Clone)]
pub struct NewSendSession {
	pub address: String,
	pub bip21: String,
	pub amount: Amount,
	pub session: String,
	pub callback_url: Option<String>,
	pub expiry_at: DateTime<Utc>,
}

/// An input observed in an original proposal, tagged with the bip21 it paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenInput {
	pub outpoint: OutPoint,
	pub bip21: String,
}

impl TryFrom<Row> for SeenInput {
	type Error = anyhow::Error;

	fn try_from(row: Row) -> Result<Self, Self::Error> {
		Ok(SeenInput {
			outpoint: OutPoint::from_str(row.get("outpoint"))
				.context("invalid outpoint in seen_input")?,
			bip21: row.get("bip21"),
		})
	}
}
