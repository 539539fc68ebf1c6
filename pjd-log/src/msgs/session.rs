
use bitcoin::Txid;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCancelled {
	pub id: i64,
	pub kind: String,
}
impl_slog!(SessionCancelled, Info, "a session was cancelled");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTxSeen {
	pub id: i64,
	pub kind: String,
	pub txid: Txid,
	pub confirmations: u32,
}
impl_slog!(SessionTxSeen, Debug, "observed a transaction for a session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackDelivered {
	pub id: i64,
	pub url: String,
	pub txid: Txid,
}
impl_slog!(CallbackDelivered, Info, "delivered the session callback");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackFailed {
	pub id: i64,
	pub url: String,
	pub error: String,
}
impl_slog!(CallbackFailed, Warn, "failed to deliver the session callback");
