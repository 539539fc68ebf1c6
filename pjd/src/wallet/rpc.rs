use anyhow::Context;
use bitcoin::{Amount, FeeRate, OutPoint, Script, Txid};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::bitcoind::{BitcoinRpcClient, RpcApi};
use crate::fees::btc_to_sat;
use super::{
	AddressInfo, DecodedPsbt, DecodedTx, FinalizedPsbt, MempoolAcceptResult, ProcessedPsbt,
	ScriptInfo, Utxo, WalletGateway,
};


#[derive(Debug, Deserialize)]
struct SmartFee {
	/// BTC/kvB
	feerate: Option<f64>,
	#[serde(default)]
	errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FundedPsbt {
	psbt: String,
}

/// The [WalletGateway] backed by bitcoind's JSON-RPC.
///
/// The rpc client is blocking, so every call runs on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct RpcWallet {
	client: BitcoinRpcClient,
}

impl RpcWallet {
	pub fn new(client: BitcoinRpcClient) -> RpcWallet {
		RpcWallet { client }
	}

	async fn call<T>(&self, wallet: Option<&str>, cmd: &'static str, args: Vec<Value>) -> anyhow::Result<T>
	where
		T: DeserializeOwned + Send + 'static,
	{
		let client = match wallet {
			Some(w) => self.client.for_wallet(w)?,
			None => self.client.clone(),
		};
		trace!("Calling bitcoind rpc {} with {:?}", cmd, args);
		tokio::task::spawn_blocking(move || client.call::<T>(cmd, &args)).await
			.context("bitcoind rpc task panicked")?
			.with_context(|| format!("bitcoind rpc {} failed", cmd))
	}
}

#[async_trait]
impl WalletGateway for RpcWallet {
	async fn decode_raw_transaction(&self, tx_hex: &str) -> anyhow::Result<DecodedTx> {
		self.call(None, "decoderawtransaction", vec![json!(tx_hex)]).await
	}

	async fn get_fee_rate(&self, conf_target: u16) -> anyhow::Result<FeeRate> {
		let res = self.call::<SmartFee>(None, "estimatesmartfee", vec![json!(conf_target)]).await?;
		match res.feerate {
			Some(btc_per_kvb) => {
				let sat_per_kvb = btc_to_sat(btc_per_kvb)?.to_sat();
				// 1 vbyte is 4 weight units
				Ok(FeeRate::from_sat_per_kwu(sat_per_kvb / 4).max(FeeRate::BROADCAST_MIN))
			},
			None => {
				warn!("No fee estimate for {} blocks ({:?}), using the minimum relay fee",
					conf_target, res.errors,
				);
				Ok(FeeRate::BROADCAST_MIN)
			},
		}
	}

	async fn list_unspent(&self, wallet: &str, min_conf: u32) -> anyhow::Result<Vec<Utxo>> {
		self.call(Some(wallet), "listunspent", vec![json!(min_conf)]).await
	}

	async fn decode_script(&self, script: &Script) -> anyhow::Result<ScriptInfo> {
		self.call(None, "decodescript", vec![json!(script.to_hex_string())]).await
	}

	async fn get_address_info(&self, address: &str, wallet: &str) -> anyhow::Result<AddressInfo> {
		self.call(Some(wallet), "getaddressinfo", vec![json!(address)]).await
	}

	async fn test_mempool_accept(&self, tx_hex: &str) -> anyhow::Result<Vec<MempoolAcceptResult>> {
		self.call(None, "testmempoolaccept", vec![json!([tx_hex])]).await
	}

	async fn process_psbt(
		&self,
		psbt: &str,
		sign: bool,
		finalize: bool,
		wallet: &str,
	) -> anyhow::Result<ProcessedPsbt> {
		self.call(Some(wallet), "walletprocesspsbt", vec![
			json!(psbt), json!(sign), json!("ALL"), json!(true), json!(finalize),
		]).await
	}

	async fn finalize_psbt(&self, psbt: &str) -> anyhow::Result<FinalizedPsbt> {
		self.call(None, "finalizepsbt", vec![json!(psbt), json!(true)]).await
	}

	async fn send_raw_transaction(&self, tx_hex: &str, wallet: &str) -> anyhow::Result<Txid> {
		self.call(Some(wallet), "sendrawtransaction", vec![json!(tx_hex)]).await
	}

	async fn lock_unspent(&self, utxos: &[OutPoint], wallet: &str) -> anyhow::Result<bool> {
		let utxos = utxos.iter()
			.map(|o| json!({ "txid": o.txid.to_string(), "vout": o.vout }))
			.collect::<Vec<_>>();
		self.call(Some(wallet), "lockunspent", vec![json!(false), json!(utxos)]).await
	}

	async fn decode_psbt(&self, psbt: &str) -> anyhow::Result<DecodedPsbt> {
		self.call(None, "decodepsbt", vec![json!(psbt)]).await
	}

	async fn get_new_address(&self, wallet: &str) -> anyhow::Result<String> {
		self.call(Some(wallet), "getnewaddress", vec![]).await
	}

	async fn create_funded_psbt(
		&self,
		wallet: &str,
		address: &str,
		amount: Amount,
		fee_rate: FeeRate,
	) -> anyhow::Result<String> {
		let outputs = json!([{ address: amount.to_btc() }]);
		let options = json!({
			"fee_rate": fee_rate.to_sat_per_vb_ceil(),
			"replaceable": true,
		});
		let res = self.call::<FundedPsbt>(Some(wallet), "walletcreatefundedpsbt", vec![
			json!([]), outputs, json!(0), options,
		]).await?;
		Ok(res.psbt)
	}
}
