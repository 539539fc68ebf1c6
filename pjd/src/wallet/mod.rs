//! The node and wallet capabilities the reconcilers need.
//!
//! Amounts in these types are decimal BTC, as bitcoind reports them. Convert
//! them with [crate::fees::btc_to_sat] before doing any arithmetic.

pub mod blocking;
pub mod rpc;
#[cfg(test)]
pub mod fake;

pub use self::blocking::BlockingWallet;
pub use self::rpc::RpcWallet;

use anyhow::Context;
use bitcoin::{Amount, FeeRate, OutPoint, Script, ScriptBuf, Txid};


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKeyInfo {
	pub hex: String,
	pub address: Option<String>,
}

impl ScriptPubKeyInfo {
	pub fn script(&self) -> anyhow::Result<ScriptBuf> {
		ScriptBuf::from_hex(&self.hex).context("invalid script hex")
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedTxOut {
	pub value: f64,
	pub n: u32,
	#[serde(rename = "scriptPubKey")]
	pub script_pubkey: ScriptPubKeyInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedTx {
	pub txid: Txid,
	pub vout: Vec<DecodedTxOut>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessUtxo {
	pub amount: f64,
	#[serde(rename = "scriptPubKey")]
	pub script_pubkey: ScriptPubKeyInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPsbtInput {
	pub witness_utxo: Option<WitnessUtxo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPsbt {
	pub tx: DecodedTx,
	pub inputs: Vec<DecodedPsbtInput>,
	/// Only present when all inputs carry utxo information.
	pub fee: Option<f64>,
}

impl DecodedPsbt {
	pub fn outputs(&self) -> &[DecodedTxOut] {
		&self.tx.vout
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
	pub txid: Txid,
	pub vout: u32,
	pub address: Option<String>,
	#[serde(rename = "scriptPubKey")]
	pub script_pubkey: String,
	pub amount: f64,
	pub confirmations: u32,
	#[serde(default = "default_true")]
	pub spendable: bool,
	#[serde(default = "default_true")]
	pub safe: bool,
}

fn default_true() -> bool { true }

impl Utxo {
	pub fn outpoint(&self) -> OutPoint {
		OutPoint::new(self.txid, self.vout)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptInfo {
	pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressInfo {
	pub ismine: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolAcceptResult {
	pub txid: Txid,
	pub allowed: bool,
	#[serde(rename = "reject-reason")]
	pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedPsbt {
	pub psbt: String,
	pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedPsbt {
	pub psbt: Option<String>,
	pub hex: Option<String>,
	pub complete: bool,
}

/// Access to the node and its wallets.
///
/// PSBTs are passed around base64-encoded, transactions hex-encoded.
#[async_trait]
pub trait WalletGateway: Send + Sync + 'static {
	async fn decode_raw_transaction(&self, tx_hex: &str) -> anyhow::Result<DecodedTx>;

	/// Estimate the fee rate to confirm within the given number of blocks.
	async fn get_fee_rate(&self, conf_target: u16) -> anyhow::Result<FeeRate>;

	async fn list_unspent(&self, wallet: &str, min_conf: u32) -> anyhow::Result<Vec<Utxo>>;

	async fn decode_script(&self, script: &Script) -> anyhow::Result<ScriptInfo>;

	async fn get_address_info(&self, address: &str, wallet: &str) -> anyhow::Result<AddressInfo>;

	async fn test_mempool_accept(&self, tx_hex: &str) -> anyhow::Result<Vec<MempoolAcceptResult>>;

	async fn process_psbt(
		&self,
		psbt: &str,
		sign: bool,
		finalize: bool,
		wallet: &str,
	) -> anyhow::Result<ProcessedPsbt>;

	async fn finalize_psbt(&self, psbt: &str) -> anyhow::Result<FinalizedPsbt>;

	async fn send_raw_transaction(&self, tx_hex: &str, wallet: &str) -> anyhow::Result<Txid>;

	/// Lock the utxos so the wallet doesn't spend them elsewhere.
	async fn lock_unspent(&self, utxos: &[OutPoint], wallet: &str) -> anyhow::Result<bool>;

	async fn decode_psbt(&self, psbt: &str) -> anyhow::Result<DecodedPsbt>;

	async fn get_new_address(&self, wallet: &str) -> anyhow::Result<String>;

	/// Create a replaceable PSBT paying `amount` to `address`, funded by `wallet`.
	async fn create_funded_psbt(
		&self,
		wallet: &str,
		address: &str,
		amount: Amount,
		fee_rate: FeeRate,
	) -> anyhow::Result<String>;
}

/// The part of [WalletGateway] that is needed from inside the synchronous
/// verification callbacks of the payjoin stages.
///
/// Calls block the current thread. Only use from blocking contexts,
/// like [tokio::task::spawn_blocking].
pub trait SyncWalletGateway: Send + Sync + 'static {
	fn test_mempool_accept(&self, tx_hex: &str) -> anyhow::Result<Vec<MempoolAcceptResult>>;

	fn process_psbt(
		&self,
		psbt: &str,
		sign: bool,
		finalize: bool,
		wallet: &str,
	) -> anyhow::Result<ProcessedPsbt>;

	fn get_address_info(&self, address: &str, wallet: &str) -> anyhow::Result<AddressInfo>;

	fn decode_script(&self, script: &Script) -> anyhow::Result<ScriptInfo>;
}
