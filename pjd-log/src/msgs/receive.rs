
use bitcoin::{Amount, OutPoint, SignedAmount, Txid};


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveSessionCreated {
	pub id: i64,
	pub address: String,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub bip21: String,
}
impl_slog!(ReceiveSessionCreated, Info, "created a new receive session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveProposalReceived {
	pub id: i64,
	pub original_txid: Txid,
	pub nb_inputs: usize,
}
impl_slog!(ReceiveProposalReceived, Info, "received an original proposal from the directory");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackTxStored {
	pub id: i64,
	pub txid: Txid,
}
impl_slog!(FallbackTxStored, Debug, "stored the fallback tx of a receive session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveGateRejected {
	pub id: i64,
	pub stage: String,
	pub error: String,
}
impl_slog!(ReceiveGateRejected, Error, "a verification gate rejected the proposal");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveProposalSubmitted {
	pub id: i64,
	pub txid: Txid,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub fee: Amount,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub receiver_fee: SignedAmount,
}
impl_slog!(ReceiveProposalSubmitted, Info, "submitted the payjoin proposal to the directory");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveSessionStalled {
	pub id: i64,
	pub reason: String,
}
impl_slog!(ReceiveSessionStalled, Warn, "receive session can't progress right now");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveSessionFailed {
	pub id: i64,
	pub error: String,
}
impl_slog!(ReceiveSessionFailed, Error, "error while reconciling a receive session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackBroadcast {
	pub id: i64,
	pub txid: Txid,
}
impl_slog!(FallbackBroadcast, Warn, "broadcast the fallback tx of a stalled receive session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackBroadcastFailed {
	pub id: i64,
	pub error: String,
}
impl_slog!(FallbackBroadcastFailed, Error, "failed to broadcast the fallback tx of a receive session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountMismatch {
	pub id: i64,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub requested: Amount,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub calculated: Amount,
}
impl_slog!(AmountMismatch, Error, "settled amount differs from the requested amount beyond tolerance");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenInputCacheRefreshFailed {
	pub error: String,
}
impl_slog!(SeenInputCacheRefreshFailed, Warn, "failed to refresh the seen input cache, keeping stale entries");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoLockFailed {
	pub outpoint: OutPoint,
	pub error: String,
}
impl_slog!(UtxoLockFailed, Warn, "failed to lock a contributed utxo");
