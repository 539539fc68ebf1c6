
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;


/// A struct to be held in scope while a process is working.
pub struct RuntimeWorker {
	mgr: RuntimeManager,
	name: &'static str,
	critical: bool,
}

impl std::ops::Drop for RuntimeWorker {
	fn drop(&mut self) {
		self.mgr.drop_worker(self.name, self.critical);
	}
}

struct Inner {
	shutdown: CancellationToken,
	workers: AtomicUsize,
	notify: Notify,
}

/// Manager of thread coordination during runtime.
#[derive(Clone)]
pub struct RuntimeManager {
	inner: Arc<Inner>,
}

impl RuntimeManager {
	pub fn new() -> RuntimeManager {
		RuntimeManager {
			inner: Arc::new(Inner {
				shutdown: CancellationToken::new(),
				workers: AtomicUsize::new(0),
				notify: Notify::new(),
			}),
		}
	}

	/// Trigger shutdown on ctrl-c or SIGTERM, and exit the process if the
	/// workers take longer than `timeout` to stop.
	pub fn run_shutdown_signal_listener(&self, timeout: Duration) {
		let rt = self.clone();
		tokio::spawn(async move {
			let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
				Ok(s) => s,
				Err(e) => {
					error!("Failed to listen for SIGTERM: {}", e);
					return;
				},
			};

			tokio::select! {
				_ = sigterm.recv() => info!("SIGTERM received! Sending shutdown signal..."),
				r = signal::ctrl_c() => match r {
					Ok(()) => info!("Ctrl+C received! Sending shutdown signal..."),
					Err(e) => {
						error!("Failed to listen to ctrl-c signal: {:#}", e);
						return;
					},
				},
			}

			rt.shutdown();
			let deadline = Instant::now() + timeout;
			while !rt.shutdown_done() {
				if let Some(time_left) = deadline.checked_duration_since(Instant::now()) {
					info!("Forced exit in {} seconds...", time_left.as_secs());
					tokio::time::sleep(Duration::from_secs(1)).await;
				} else {
					error!("Graceful shutdown took too long, exiting...");
					std::process::exit(0);
				}
			}
		});
	}

	fn add_worker(&self) {
		self.inner.workers.fetch_add(1, atomic::Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	fn sub_worker(&self) {
		let old = self.inner.workers.fetch_sub(1, atomic::Ordering::SeqCst);
		debug_assert_ne!(old, 0);
		self.inner.notify.notify_waiters();
	}

	/// Create a worker that will inform the [RuntimeManager] when it goes out of scope.
	pub fn spawn(&self, name: &'static str) -> RuntimeWorker {
		self.add_worker();
		slog!(WorkerStarted, name: name.into());
		RuntimeWorker {
			mgr: self.clone(),
			name: name,
			critical: false,
		}
	}

	/// Create a worker that will inform the [RuntimeManager] when it goes out of scope.
	///
	/// When a critical worker ends, shutdown will be triggered.
	pub fn spawn_critical(&self, name: &'static str) -> RuntimeWorker {
		self.add_worker();
		slog!(WorkerStarted, name: name.into());
		RuntimeWorker {
			mgr: self.clone(),
			name: name,
			critical: true,
		}
	}

	fn drop_worker(&self, name: &'static str, critical: bool) {
		self.sub_worker();
		if critical && !self.inner.shutdown.is_cancelled() {
			slog!(CriticalWorkerStopped, name: name.into());
			self.shutdown();
		} else {
			slog!(WorkerStopped, name: name.into());
		}
	}

	/// Start system shutdown.
	pub fn shutdown(&self) {
		self.inner.shutdown.cancel();
	}

	pub fn is_shutting_down(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	pub fn shutdown_done(&self) -> bool {
		self.inner.workers.load(atomic::Ordering::SeqCst) == 0
	}

	/// Wait for shutdown to finish.
	pub async fn wait(&self) {
		loop {
			let notified = self.inner.notify.notified();
			if self.shutdown_done() {
				return;
			}
			notified.await;
		}
	}

	/// Start system shutdown and wait for it to finish.
	pub async fn shutdown_wait(&self) {
		self.shutdown();
		self.wait().await;
	}

	pub fn shutdown_signal(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
		self.inner.shutdown.cancelled()
	}
}
