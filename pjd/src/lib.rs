#[macro_use] extern crate anyhow;
#[macro_use] extern crate async_trait;
#[macro_use] extern crate log;
#[macro_use] extern crate serde;
#[macro_use] extern crate pjd_log;

#[macro_use]
pub mod error;

pub mod bitcoind;
pub mod config;
pub mod database;
pub mod fees;
pub mod lock;
pub mod protocol;
pub mod receiver;
pub mod repository;
pub mod scheduler;
pub mod seen;
pub mod sender;
pub mod service;
pub mod wallet;

pub(crate) mod serde_util;
pub(crate) mod system;
#[cfg(test)]
mod test_log;

pub use crate::config::Config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::bitcoind::{BitcoinRpcClient, RpcApi};
use crate::lock::Locker;
use crate::lock::postgres::PgLockBackend;
use crate::protocol::{Directory, HttpTransport};
use crate::receiver::ReceiverReconciler;
use crate::repository::SessionRepository;
use crate::scheduler::Scheduler;
use crate::seen::SeenInputCache;
use crate::sender::SenderReconciler;
use crate::service::{HttpCallbacks, SessionService};
use crate::system::RuntimeManager;
use crate::wallet::WalletGateway;
use crate::wallet::blocking::BlockingWallet;
use crate::wallet::rpc::RpcWallet;


/// How long we give the scheduler to finish its tick on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// The daemon, wired up.
pub struct Pjd {
	cfg: Config,
	repo: Arc<dyn SessionRepository>,
	wallet: Arc<dyn WalletGateway>,
	locker: Locker,
	directory: Arc<Directory>,
	service: SessionService,
}

impl Pjd {
	/// Connect to the database and bitcoind.
	pub async fn open(cfg: Config) -> anyhow::Result<Pjd> {
		info!("Connecting to db at {}:{}", cfg.postgres.host, cfg.postgres.port);
		let db = database::Db::connect(&cfg.postgres).await
			.context("failed to connect to db")?;
		let locks = PgLockBackend::connect(&cfg.postgres, cfg.lock_timeout).await
			.context("failed to connect lock backend")?;

		let bitcoind = BitcoinRpcClient::new(&cfg.bitcoind.url, cfg.bitcoind_auth()?)
			.context("failed to create bitcoind rpc client")?;
		let rpc = bitcoind.clone();
		let chain_info = tokio::task::spawn_blocking(move || rpc.get_blockchain_info()).await
			.context("bitcoind rpc task panicked")?
			.context("failed to reach bitcoind")?;
		if chain_info.chain != cfg.network {
			bail!("Our bitcoind is running on network {} while we are configured for network {}",
				chain_info.chain, cfg.network,
			);
		}

		let repo = Arc::new(db) as Arc<dyn SessionRepository>;
		let wallet = Arc::new(RpcWallet::new(bitcoind)) as Arc<dyn WalletGateway>;
		let locker = Locker::new(Arc::new(locks), cfg.lock_timeout);
		let directory = Arc::new(Directory::from_config(&cfg)?);
		let callbacks = Arc::new(HttpCallbacks::new(cfg.http_timeout)?);
		let service = SessionService::new(
			&cfg, repo.clone(), wallet.clone(), locker.clone(), directory.clone(), callbacks,
		);

		Ok(Pjd { cfg, repo, wallet, locker, directory, service })
	}

	pub fn service(&self) -> &SessionService {
		&self.service
	}

	/// Run the scheduler until shutdown.
	pub async fn run(self) -> anyhow::Result<()> {
		let partition = self.cfg.partition();
		info!("Starting pjd as replica {} of {}", partition.replica_id, partition.total_replicas);

		let rtmgr = RuntimeManager::new();
		let startup_worker = rtmgr.spawn("Bootstrapping");
		rtmgr.run_shutdown_signal_listener(SHUTDOWN_TIMEOUT);

		let transport = Arc::new(HttpTransport::new(self.cfg.http_timeout)?);
		let sync_wallet = Arc::new(BlockingWallet::start(self.wallet.clone())
			.context("failed to start blocking wallet")?);
		let seen = Arc::new(SeenInputCache::new(self.repo.clone(), self.cfg.seen_input_ttl));

		let sender = Arc::new(SenderReconciler::new(
			&self.cfg,
			self.repo.clone(),
			self.wallet.clone(),
			transport.clone(),
			self.directory.clone(),
			self.locker.clone(),
		));
		let receiver = Arc::new(ReceiverReconciler::new(
			&self.cfg,
			self.repo.clone(),
			self.wallet.clone(),
			sync_wallet,
			transport,
			self.directory,
			self.locker.clone(),
			seen,
		));
		let scheduler = Scheduler::new(
			self.repo.clone(), self.locker.clone(), sender, receiver, partition, self.cfg.cron_interval,
		);
		tokio::spawn(scheduler.run(rtmgr.clone()));

		drop(startup_worker);
		rtmgr.wait().await;
		slog!(PjdTerminated);
		Ok(())
	}
}
