
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bitcoin::OutPoint;
use parking_lot::Mutex;

use crate::repository::SessionRepository;


struct Inner {
	entries: HashMap<OutPoint, String>,
	refreshed_at: Option<Instant>,
	/// Inputs seen during the current gate pass, not yet stored.
	staged: Vec<OutPoint>,
}

/// Read-through cache of the inputs seen in original proposals.
///
/// An input is tagged with the bip21 of the first session it was seen in.
/// The durable table is the source of truth, the cache may lag behind it
/// by up to its ttl.
pub struct SeenInputCache {
	repo: Arc<dyn SessionRepository>,
	ttl: Duration,
	inner: Mutex<Inner>,
	refreshing: AtomicBool,
}

impl SeenInputCache {
	pub fn new(repo: Arc<dyn SessionRepository>, ttl: Duration) -> SeenInputCache {
		SeenInputCache {
			repo,
			ttl,
			inner: Mutex::new(Inner {
				entries: HashMap::new(),
				refreshed_at: None,
				staged: Vec::new(),
			}),
			refreshing: AtomicBool::new(false),
		}
	}

	/// Whether the input was already seen, tagged with a different bip21.
	pub fn is_known(&self, outpoint: &OutPoint, bip21: &str) -> bool {
		let inner = self.inner.lock();
		match inner.entries.get(outpoint) {
			None => false,
			Some(tag) => !tag.is_empty() && tag != bip21,
		}
	}

	/// Stage an input to be stored on the next [SeenInputCache::flush].
	pub fn record_new_input(&self, outpoint: OutPoint) {
		let mut inner = self.inner.lock();
		if !inner.entries.contains_key(&outpoint) && !inner.staged.contains(&outpoint) {
			inner.staged.push(outpoint);
		}
	}

	/// Store all staged inputs tagged with `bip21`.
	///
	/// On failure the staged inputs are kept for the next flush.
	pub async fn flush(&self, bip21: &str) -> anyhow::Result<()> {
		let staged = std::mem::take(&mut self.inner.lock().staged);
		if staged.is_empty() {
			return Ok(());
		}

		if let Err(e) = self.repo.store_seen_inputs(&staged, bip21).await {
			let mut inner = self.inner.lock();
			inner.staged.extend(staged);
			return Err(e.context("failed to store seen inputs"));
		}

		let mut inner = self.inner.lock();
		for outpoint in staged {
			inner.entries.entry(outpoint).or_insert_with(|| bip21.to_owned());
		}
		Ok(())
	}

	fn is_stale(&self) -> bool {
		match self.inner.lock().refreshed_at {
			Some(t) => t.elapsed() >= self.ttl,
			None => true,
		}
	}

	/// Reload the cache from storage if the ttl expired.
	///
	/// On failure the current entries are kept.
	pub async fn refresh(&self) {
		if !self.is_stale() {
			return;
		}

		match self.repo.list_seen_inputs().await {
			Ok(inputs) => {
				let mut inner = self.inner.lock();
				inner.entries = inputs.into_iter().map(|i| (i.outpoint, i.bip21)).collect();
				inner.refreshed_at = Some(Instant::now());
				trace!("Refreshed seen input cache with {} entries", inner.entries.len());
			},
			Err(e) => {
				slog!(SeenInputCacheRefreshFailed, error: format!("{:#}", e));
			},
		}
	}

	/// Start a [SeenInputCache::refresh] on a separate task if the ttl
	/// expired and none is running yet.
	///
	/// Lookups keep answering from the current entries in the meantime.
	pub fn refresh_in_background(self: &Arc<Self>) {
		if !self.is_stale() || self.refreshing.swap(true, Ordering::AcqRel) {
			return;
		}
		let cache = self.clone();
		tokio::spawn(async move {
			cache.refresh().await;
			cache.refreshing.store(false, Ordering::Release);
		});
	}

	pub fn len(&self) -> usize {
		self.inner.lock().entries.len()
	}
}
