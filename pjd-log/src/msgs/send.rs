
use bitcoin::{Amount, SignedAmount, Txid};


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSessionCreated {
	pub id: i64,
	pub address: String,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}
impl_slog!(SendSessionCreated, Info, "created a new send session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendProposalBroadcast {
	pub id: i64,
	pub txid: Txid,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub fee: Amount,
	/// Negative when the receiver paid part of our fee.
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub sender_fee: SignedAmount,
}
impl_slog!(SendProposalBroadcast, Info, "broadcast the signed payjoin transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSessionFailed {
	pub id: i64,
	pub error: String,
}
impl_slog!(SendSessionFailed, Error, "error while reconciling a send session");
