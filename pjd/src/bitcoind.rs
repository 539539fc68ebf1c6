pub use bdk_bitcoind_rpc::bitcoincore_rpc::RpcApi;

use std::sync::Arc;

use bdk_bitcoind_rpc::bitcoincore_rpc::{Auth, Client, Error};


/// Clonable bitcoind rpc client.
#[derive(Debug, Clone)]
pub struct BitcoinRpcClient {
	client: Arc<Client>,
	url: String,
	auth: Auth,
}

impl BitcoinRpcClient {
	pub fn new(url: &str, auth: Auth) -> anyhow::Result<Self> {
		Ok(BitcoinRpcClient {
			client: Arc::new(Client::new(url, auth.clone())?),
			url: url.to_owned(),
			auth: auth,
		})
	}

	/// A client talking to the endpoint of the named wallet.
	pub fn for_wallet(&self, wallet: &str) -> anyhow::Result<Self> {
		let url = format!("{}/wallet/{}", self.url.trim_end_matches('/'), wallet);
		Self::new(&url, self.auth.clone())
	}

	pub fn url(&self) -> &str {
		&self.url
	}
}

impl RpcApi for BitcoinRpcClient {
	fn call<T: for<'a> serde::de::Deserialize<'a>>(
		&self, cmd: &str, args: &[serde_json::Value],
	) -> Result<T, Error> {
		self.client.call(cmd, args)
	}
}
