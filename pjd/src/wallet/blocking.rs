use std::sync::Arc;
use std::sync::mpsc;

use anyhow::Context;
use bitcoin::Script;
use futures::future::BoxFuture;
use futures::FutureExt;

use super::{AddressInfo, MempoolAcceptResult, ProcessedPsbt, ScriptInfo, SyncWalletGateway, WalletGateway};


type Job = Box<dyn FnOnce(Arc<dyn WalletGateway>) -> BoxFuture<'static, ()> + Send>;

/// Synchronous access to a [WalletGateway].
///
/// This is the one place where the async wallet is called in a blocking
/// manner. Calls are handed to a dedicated thread running its own
/// single-threaded runtime and the caller blocks until the reply arrives.
/// That means a call never needs a worker of the caller's runtime, but the
/// caller's thread is blocked, so only call from [tokio::task::spawn_blocking]
/// or plain threads.
///
/// The thread exits when the [BlockingWallet] is dropped.
#[derive(Clone)]
pub struct BlockingWallet {
	jobs: mpsc::Sender<Job>,
}

impl BlockingWallet {
	pub fn start(wallet: Arc<dyn WalletGateway>) -> anyhow::Result<BlockingWallet> {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.context("failed to build blocking wallet runtime")?;

		let (tx, rx) = mpsc::channel::<Job>();
		std::thread::Builder::new()
			.name("pjd-sync-wallet".into())
			.spawn(move || {
				while let Ok(job) = rx.recv() {
					rt.block_on(job(wallet.clone()));
				}
				debug!("Blocking wallet thread exiting");
			})
			.context("failed to spawn blocking wallet thread")?;

		Ok(BlockingWallet { jobs: tx })
	}

	fn run<T, F>(&self, f: F) -> anyhow::Result<T>
	where
		T: Send + 'static,
		F: FnOnce(Arc<dyn WalletGateway>) -> BoxFuture<'static, anyhow::Result<T>> + Send + 'static,
	{
		let (reply_tx, reply_rx) = mpsc::sync_channel(1);
		let job: Job = Box::new(move |wallet| async move {
			// the caller might have given up
			let _ = reply_tx.send(f(wallet).await);
		}.boxed());

		self.jobs.send(job).map_err(|_| anyhow!("blocking wallet thread is gone"))?;
		reply_rx.recv().context("blocking wallet thread dropped the call")?
	}
}

impl SyncWalletGateway for BlockingWallet {
	fn test_mempool_accept(&self, tx_hex: &str) -> anyhow::Result<Vec<MempoolAcceptResult>> {
		let tx_hex = tx_hex.to_owned();
		self.run(move |w| async move { w.test_mempool_accept(&tx_hex).await }.boxed())
	}

	fn process_psbt(
		&self,
		psbt: &str,
		sign: bool,
		finalize: bool,
		wallet: &str,
	) -> anyhow::Result<ProcessedPsbt> {
		let (psbt, wallet) = (psbt.to_owned(), wallet.to_owned());
		self.run(move |w| async move { w.process_psbt(&psbt, sign, finalize, &wallet).await }.boxed())
	}

	fn get_address_info(&self, address: &str, wallet: &str) -> anyhow::Result<AddressInfo> {
		let (address, wallet) = (address.to_owned(), wallet.to_owned());
		self.run(move |w| async move { w.get_address_info(&address, &wallet).await }.boxed())
	}

	fn decode_script(&self, script: &Script) -> anyhow::Result<ScriptInfo> {
		let script = script.to_owned();
		self.run(move |w| async move { w.decode_script(&script).await }.boxed())
	}
}
