use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bdk_bitcoind_rpc::bitcoincore_rpc::Auth;
use config::{Environment, File};

use crate::repository::Partition;
use crate::serde_util;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Bitcoind {
	/// the URL of the bitcoind RPC (mandatory)
	pub url: String,
	/// the path of the cookie file for the bitcoind RPC
	/// It is mandatory to configure exactly one authentication method
	/// This could either be [bitcoind.cookie] or [bitcoind.rpc_user] and [bitcoind.rpc_pass]
	pub cookie: Option<PathBuf>,
	/// the user for the bitcoind RPC
	pub rpc_user: Option<String>,
	/// the password for the bitcoind RPC
	pub rpc_pass: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Postgres {
	pub host: String,
	pub port: u16,
	pub name: String,
	pub user: Option<String>,
	pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub data_dir: PathBuf,
	/// Directory to place structured log files.
	pub log_dir: Option<PathBuf>,
	pub log_level: log::LevelFilter,
	pub network: bitcoin::Network,

	/// The interval at which the scheduler reconciles sessions.
	#[serde(with = "serde_util::duration")]
	pub cron_interval: Duration,
	/// Maximum time to wait for all keys of a lock acquisition.
	#[serde(with = "serde_util::duration")]
	pub lock_timeout: Duration,

	/// The 1-based index of this replica.
	pub replica_id: u32,
	/// The total number of replicas sharing the session tables.
	pub total_replicas: u32,

	/// The wallet that funds send sessions.
	pub send_wallet: String,
	/// The wallet that receives and contributes inputs to payjoins.
	pub receive_wallet: String,

	/// The payjoin directory that holds the session mailboxes.
	pub payjoin_directory: String,
	/// The OHTTP relay all directory traffic goes through.
	pub ohttp_relay: String,
	/// The OHTTP keys of the directory, as in payjoin uris.
	///
	/// Fetched from the directory through the relay when not set.
	pub ohttp_keys: Option<String>,
	/// Lifetime of new sessions.
	#[serde(with = "serde_util::duration")]
	pub payjoin_expiry: Duration,
	/// Time after a failure before the fallback tx of a receive session is broadcast.
	#[serde(with = "serde_util::duration")]
	pub fallback_delay: Duration,
	#[serde(with = "serde_util::duration")]
	pub seen_input_ttl: Duration,
	/// Maximum number of utxos considered for contribution to a payjoin.
	pub max_input_candidates: usize,

	/// Timeout for directory requests and session callbacks.
	#[serde(with = "serde_util::duration")]
	pub http_timeout: Duration,

	pub postgres: Postgres,
	pub bitcoind: Bitcoind,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			data_dir: "./pjd".into(),
			log_dir: None,
			log_level: log::LevelFilter::Debug,
			network: bitcoin::Network::Regtest,
			cron_interval: Duration::from_secs(60),
			lock_timeout: Duration::from_secs(60),
			replica_id: 1,
			total_replicas: 1,
			send_wallet: String::from("01"),
			receive_wallet: String::from("01"),
			payjoin_directory: String::from("https://payjo.in"),
			ohttp_relay: String::from("https://pj.benalleng.com"),
			ohttp_keys: None,
			payjoin_expiry: Duration::from_secs(60 * 60),
			fallback_delay: Duration::from_secs(2 * 60),
			seen_input_ttl: Duration::from_secs(60),
			max_input_candidates: 20,
			http_timeout: Duration::from_secs(10),
			postgres: Postgres {
				host: String::from("localhost"),
				port: 5432,
				name: String::from("pjd"),
				user: None,
				password: None,
			},
			bitcoind: Bitcoind {
				url: "http://127.0.0.1:18443".into(),
				cookie: None,
				rpc_user: None,
				rpc_pass: None,
			},
		}
	}
}

impl Config {
	fn load_with_custom_env(
		config_file: Option<&Path>,
		#[cfg(test)]
		custom_env: Option<std::collections::HashMap<String, String>>,
	) -> anyhow::Result<Self> {
		let default = config::Config::try_from(&Self::default())
			.context("default config failed to deconstruct")?;

		// Three layers:
		// - the defaults defined in Config's Default impl
		// - the config file passed in this function, if any
		// - environment variables (prefixed with `PJD__`)

		let mut builder = config::Config::builder()
			.add_source(default);
		if let Some(file) = config_file {
			builder = builder.add_source(File::from(file));
		}

		let env = Environment::with_prefix("PJD")
			.prefix_separator("__")
			.separator("__");
		#[cfg(test)]
		let env = env.source(custom_env);
		builder = builder.add_source(env);

		let cfg = builder.build().context("error building config")?;
		Ok(cfg.try_deserialize().context("error parsing config")?)
	}

	pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
		Self::load_with_custom_env(config_file, #[cfg(test)] None)
	}

	/// Verifies if the specified configuration is valid
	pub fn validate(&self) -> anyhow::Result<()> {
		let with_user_pass = match (&self.bitcoind.rpc_user, &self.bitcoind.rpc_pass) {
			(Some(_), None) => bail!("Missing configuration bitcoind.rpc_pass. \
				This is required if bitcoind.rpc_user is provided"),
			(None, Some(_)) => bail!("Missing configuration bitcoind.rpc_user. \
				This is required if bitcoind.rpc_pass is provided"),
			(None, None) => false,
			(Some(_),Some(_)) => true,
		};

		if !with_user_pass && self.bitcoind.cookie.is_none() {
			bail!("Configuring authentication to bitcoind is mandatory. \
				Specify either bitcoind.cookie or (bitcoind.rpc_user and bitcoind.rpc_pass).")
		} else if with_user_pass && self.bitcoind.cookie.is_some() {
			bail!("Invalid configuration for authentication to bitcoind. Use either \
				bitcoind.cookie or (bitcoind.rpc_user and bitcoind.rpc_pass) but not both.")
		}

		if self.total_replicas == 0 {
			bail!("total_replicas must be at least 1");
		}
		if self.replica_id == 0 || self.replica_id > self.total_replicas {
			bail!("replica_id must be between 1 and total_replicas ({}), got {}",
				self.total_replicas, self.replica_id,
			);
		}

		if self.send_wallet.is_empty() || self.receive_wallet.is_empty() {
			bail!("send_wallet and receive_wallet can't be empty");
		}
		if self.max_input_candidates == 0 {
			bail!("max_input_candidates must be at least 1");
		}
		if !self.payjoin_directory.starts_with("http") {
			bail!("payjoin_directory must be an http(s) url: {}", self.payjoin_directory);
		}
		if !self.ohttp_relay.starts_with("http") {
			bail!("ohttp_relay must be an http(s) url: {}", self.ohttp_relay);
		}
		if let Some(ref keys) = self.ohttp_keys {
			crate::protocol::decode_ohttp_keys(keys).context("invalid ohttp_keys")?;
		}

		Ok(())
	}

	pub fn bitcoind_auth(&self) -> anyhow::Result<Auth> {
		match (&self.bitcoind.rpc_user, &self.bitcoind.rpc_pass) {
			(Some(user), Some(pass)) => Ok(Auth::UserPass(user.into(), pass.into())),
			(Some(_), None) => bail!("Missing configuration for bitcoind.rpc_pass."),
			(None, Some(_)) => bail!("Missing configuration for bitcoind.rpc_user."),
			(None, None) => {
				let cookie = self.bitcoind.cookie.as_ref()
					.context("The bitcoind.cookie must be set if username and password aren't provided")?;
				Ok(Auth::CookieFile(cookie.into()))
			},
		}
	}

	/// The slice of the session tables this replica works on.
	pub fn partition(&self) -> Partition {
		Partition {
			replica_id: self.replica_id,
			total_replicas: self.total_replicas,
		}
	}

	/// Write the config into the writer.
	pub fn write_into(&self, writer: &mut dyn io::Write) -> anyhow::Result<()> {
		let s = toml::to_string_pretty(self).context("config serialization error")?;
		writer.write_all(s.as_bytes()).context("error writing config to writer")?;
		Ok(())
	}
}
