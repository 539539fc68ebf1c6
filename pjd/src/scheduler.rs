use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::lock::Locker;
use crate::receiver::ReceiverReconciler;
use crate::repository::{Partition, SessionRepository};
use crate::sender::SenderReconciler;
use crate::system::RuntimeManager;


/// The counts of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
	pub send_sessions: usize,
	pub receive_sessions: usize,
	pub fallbacks: usize,
}

/// Periodically reconciles all sessions of this replica's partition.
pub struct Scheduler {
	repo: Arc<dyn SessionRepository>,
	locker: Locker,
	sender: Arc<SenderReconciler>,
	receiver: Arc<ReceiverReconciler>,
	partition: Partition,
	interval: Duration,
}

impl Scheduler {
	pub fn new(
		repo: Arc<dyn SessionRepository>,
		locker: Locker,
		sender: Arc<SenderReconciler>,
		receiver: Arc<ReceiverReconciler>,
		partition: Partition,
		interval: Duration,
	) -> Scheduler {
		Scheduler { repo, locker, sender, receiver, partition, interval }
	}

	/// The lock held for the duration of a tick.
	fn cron_key(&self) -> String {
		format!("sessions:{}", self.partition.replica_id)
	}

	pub async fn run(self, rtmgr: RuntimeManager) {
		let _worker = rtmgr.spawn_critical("Scheduler");
		info!("Starting Scheduler...");

		let mut interval = tokio::time::interval(self.interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = interval.tick() => {
					self.tick(Utc::now()).await;
				}
				_ = rtmgr.shutdown_signal() => {
					info!("Shutdown signal received. Exiting Scheduler loop...");
					break;
				}
			}
		}

		info!("Scheduler terminated gracefully.");
	}

	/// Run a tick unless the previous one is still going.
	///
	/// Returns [None] if the tick was skipped.
	pub async fn tick(&self, now: DateTime<Utc>) -> Option<TickSummary> {
		let key = self.cron_key();
		if self.locker.is_busy(&key).await {
			slog!(SchedulerTickSkipped, replica_id: self.partition.replica_id);
			return None;
		}

		let start = Instant::now();
		let res = self.locker.with_lock([key], async {
			Ok(self.reconcile_all(now).await)
		}).await;
		match res {
			Ok(summary) => {
				slog!(SchedulerTickFinished, replica_id: self.partition.replica_id,
					send_sessions: summary.send_sessions,
					receive_sessions: summary.receive_sessions,
					fallbacks: summary.fallbacks,
					duration: start.elapsed(),
				);
				Some(summary)
			},
			Err(e) => {
				warn!("Scheduler tick didn't run: {:#}", e);
				None
			},
		}
	}

	/// Reconcile every eligible session once.
	///
	/// Failures are contained per session, the rest of the batch still runs.
	async fn reconcile_all(&self, now: DateTime<Utc>) -> TickSummary {
		let mut summary = TickSummary::default();

		match self.repo.list_active_send_sessions(self.partition, now).await {
			Ok(sessions) => for session in sessions {
				self.sender.reconcile(session.id, now).await;
				summary.send_sessions += 1;
			},
			Err(e) => error!("Failed to list send sessions: {:#}", e),
		}

		match self.repo.list_active_receive_sessions(self.partition, now).await {
			Ok(sessions) => for session in sessions {
				self.receiver.reconcile(session.id, now).await;
				summary.receive_sessions += 1;
			},
			Err(e) => error!("Failed to list receive sessions: {:#}", e),
		}

		match self.receiver.sweep_fallbacks(self.partition, now).await {
			Ok(n) => summary.fallbacks = n,
			Err(e) => error!("Fallback sweep failed: {:#}", e),
		}

		summary
	}
}
