//! Payjoin v2 sessions through a store-and-forward directory.
//!
//! The protocol, including the OHTTP encapsulation of every message, is done
//! by the `payjoin` crate. What lives here is how its requests reach the
//! directory and where session state is kept: every session is the event
//! log of its payjoin state machine, stored as JSON on the session row and
//! replayed at the start of each pass.

#[cfg(test)]
pub mod fake;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use std::str::FromStr;

use anyhow::Context;
use parking_lot::Mutex;
use payjoin::{OhttpKeys, PjUri, UriExt};
use payjoin::persist::SessionPersister;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::Config;


pub type ReceiverLog = EventLog<payjoin::receive::v2::SessionEvent>;
pub type SenderLog = EventLog<payjoin::send::v2::SessionEvent>;

/// How requests reach the directory.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
	/// Post the request and return the response body.
	async fn send(&self, req: &payjoin::Request) -> anyhow::Result<Vec<u8>>;
}

/// [Transport] over https. The requests are addressed to the relay.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: reqwest::Client,
}

impl HttpTransport {
	pub fn new(timeout: Duration) -> anyhow::Result<HttpTransport> {
		let client = reqwest::Client::builder().timeout(timeout).build()
			.context("failed to build http client")?;
		Ok(HttpTransport { client })
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, req: &payjoin::Request) -> anyhow::Result<Vec<u8>> {
		let url = req.url.to_string();
		let res = self.client.post(&url)
			.header(reqwest::header::CONTENT_TYPE, req.content_type.to_string())
			.body(req.body.to_vec())
			.send().await
			.with_context(|| format!("request to {} failed", url))?
			.error_for_status()
			.with_context(|| format!("request to {} was refused", url))?;
		let body = res.bytes().await
			.with_context(|| format!("failed to read response from {}", url))?;
		Ok(body.to_vec())
	}
}

/// The directory sessions meet at, and the relay we reach it through.
pub struct Directory {
	pub url: String,
	pub relay: String,
	keys: tokio::sync::OnceCell<OhttpKeys>,
}

impl Directory {
	pub fn new(url: impl Into<String>, relay: impl Into<String>, keys: Option<OhttpKeys>) -> Directory {
		Directory {
			url: url.into(),
			relay: relay.into(),
			keys: tokio::sync::OnceCell::new_with(keys),
		}
	}

	pub fn from_config(cfg: &Config) -> anyhow::Result<Directory> {
		let keys = match cfg.ohttp_keys {
			Some(ref keys) => Some(decode_ohttp_keys(keys).context("invalid ohttp_keys")?),
			None => None,
		};
		Ok(Directory::new(cfg.payjoin_directory.clone(), cfg.ohttp_relay.clone(), keys))
	}

	/// The OHTTP keys of the directory, fetched through the relay on first use.
	pub async fn ohttp_keys(&self) -> anyhow::Result<OhttpKeys> {
		let keys = self.keys.get_or_try_init(|| async {
			let keys = payjoin::io::fetch_ohttp_keys(self.relay.as_str(), self.url.as_str()).await
				.map_err(|e| anyhow!("failed to fetch ohttp keys of {}: {:?}", self.url, e))?;
			info!("Fetched ohttp keys of payjoin directory {}", self.url);
			Ok::<_, anyhow::Error>(keys)
		}).await?;
		Ok(keys.clone())
	}
}

/// Parse OHTTP keys in the compact form they take in payjoin uris.
pub fn decode_ohttp_keys(s: &str) -> anyhow::Result<OhttpKeys> {
	OhttpKeys::from_str(s.trim()).map_err(|e| anyhow!("invalid ohttp keys: {}", e))
}

/// Parse a bip21 uri that must carry payjoin parameters.
pub fn parse_pj_uri(bip21: &str) -> anyhow::Result<PjUri<'static>> {
	let uri = payjoin::Uri::from_str(bip21).map_err(|e| anyhow!("invalid bip21 uri: {}", e))?;
	uri.assume_checked().check_pj_supported()
		.map_err(|_| anyhow!("uri has no payjoin endpoint: {}", bip21))
}

/// An error of one of our callbacks, handed to the payjoin state machine.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(String);

pub fn callback_error(e: anyhow::Error) -> payjoin::ImplementationError {
	payjoin::ImplementationError::new(CallbackError(format!("{:#}", e)))
}

/// The events of one payjoin session.
///
/// The log only lives in memory. After a pass the caller writes
/// [EventLog::to_json] back into the session row.
#[derive(Debug)]
pub struct EventLog<E> {
	events: Arc<Mutex<Vec<E>>>,
}

impl<E> Clone for EventLog<E> {
	fn clone(&self) -> Self {
		EventLog { events: self.events.clone() }
	}
}

impl<E: Clone + Serialize + DeserializeOwned> EventLog<E> {
	pub fn new() -> EventLog<E> {
		EventLog { events: Arc::new(Mutex::new(Vec::new())) }
	}

	pub fn from_json(json: &str) -> anyhow::Result<EventLog<E>> {
		let events = serde_json::from_str::<Vec<E>>(json).context("corrupt session event log")?;
		Ok(EventLog { events: Arc::new(Mutex::new(events)) })
	}

	pub fn to_json(&self) -> anyhow::Result<String> {
		Ok(serde_json::to_string(&*self.events.lock()).context("failed to serialize session events")?)
	}

	pub fn len(&self) -> usize {
		self.events.lock().len()
	}
}

impl<E: Clone + 'static> SessionPersister for EventLog<E> {
	type InternalStorageError = Infallible;
	type SessionEvent = E;

	fn save_event(&self, event: E) -> Result<(), Infallible> {
		self.events.lock().push(event);
		Ok(())
	}

	fn load(&self) -> Result<Box<dyn Iterator<Item = E>>, Infallible> {
		Ok(Box::new(self.events.lock().clone().into_iter()))
	}

	fn close(&self) -> Result<(), Infallible> {
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use std::str::FromStr;

	use bitcoin::{Address, Amount, Network};
	use payjoin::receive::v2::{replay_event_log, ReceiveSession, ReceiverBuilder};

	use crate::protocol::fake::FakeDirectory;
	use super::*;

	#[test]
	fn receiver_log_survives_storage() {
		let fake = FakeDirectory::new();
		let address = Address::from_str("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080").unwrap()
			.require_network(Network::Regtest).unwrap();
		let log = ReceiverLog::new();
		let receiver = ReceiverBuilder::new(address, fake.url(), fake.ohttp_keys()).unwrap()
			.with_amount(Amount::from_sat(21_000))
			.build()
			.save(&log).unwrap();
		let uri = receiver.pj_uri().to_string();
		assert!(log.len() > 0);

		let json = log.to_json().unwrap();
		let stored = ReceiverLog::from_json(&json).unwrap();
		assert_eq!(stored.len(), log.len());
		let (state, history) = replay_event_log(&stored).unwrap();
		match state {
			ReceiveSession::Initialized(r) => assert_eq!(r.pj_uri().to_string(), uri),
			_ => panic!("unexpected state after replay"),
		}
		assert_eq!(history.pj_uri().to_string(), uri);
		assert!(history.fallback_tx().is_none());

		assert!(ReceiverLog::from_json("{").is_err());
	}

	#[test]
	fn ohttp_keys_in_uri_form() {
		let fake = FakeDirectory::new();
		let encoded = fake.ohttp_keys().to_string();
		assert_eq!(decode_ohttp_keys(&encoded).unwrap(), fake.ohttp_keys());
		assert_eq!(decode_ohttp_keys(&format!(" {}\n", encoded)).unwrap(), fake.ohttp_keys());

		assert!(decode_ohttp_keys("not base64!").is_err());
		assert!(decode_ohttp_keys("AQ").is_err());
	}

	#[test]
	fn pj_uri_needs_an_endpoint() {
		let fake = FakeDirectory::new();
		let address = Address::from_str("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080").unwrap()
			.require_network(Network::Regtest).unwrap();
		let receiver = ReceiverBuilder::new(address.clone(), fake.url(), fake.ohttp_keys()).unwrap()
			.with_amount(Amount::from_sat(21_000))
			.build()
			.save(&ReceiverLog::new()).unwrap();
		let uri = parse_pj_uri(&receiver.pj_uri().to_string()).unwrap();
		assert_eq!(uri.amount, Some(Amount::from_sat(21_000)));
		assert_eq!(uri.address, address);

		assert!(parse_pj_uri(&format!("bitcoin:{}?amount=0.1", address)).is_err());
		assert!(parse_pj_uri("not a uri").is_err());
	}

	#[tokio::test]
	async fn configured_ohttp_keys_are_not_fetched() {
		let fake = FakeDirectory::new();
		let mut cfg = Config::default();
		cfg.ohttp_keys = Some(fake.ohttp_keys().to_string());
		// nothing listens there, so a fetch would fail
		cfg.ohttp_relay = "http://127.0.0.1:1".into();
		let dir = Directory::from_config(&cfg).unwrap();
		assert_eq!(dir.ohttp_keys().await.unwrap(), fake.ohttp_keys());

		cfg.ohttp_keys = Some("nope".into());
		assert!(Directory::from_config(&cfg).is_err());
	}
}
