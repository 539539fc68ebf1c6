//! An in-memory payjoin directory behind its OHTTP gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::*;


/// Size of every encapsulated gateway response.
const ENCAPSULATED_MESSAGE_BYTES: usize = 8192;
const BHTTP_RES_BYTES: usize = ENCAPSULATED_MESSAGE_BYTES - (32 + 16);

/// A request as the directory saw it after decapsulation.
#[derive(Debug, Clone)]
pub struct MailboxRequest {
	pub method: String,
	pub mailbox: String,
	pub content: Vec<u8>,
}

pub struct FakeDirectory {
	gateway: Mutex<ohttp::Server>,
	mailboxes: Mutex<HashMap<String, Vec<u8>>>,
	/// Encapsulated request bodies, as they came in.
	bodies: Mutex<Vec<Vec<u8>>>,
	requests: Mutex<Vec<MailboxRequest>>,
	pub unreachable: AtomicBool,
}

impl FakeDirectory {
	pub fn new() -> FakeDirectory {
		use ohttp::hpke::{Aead, Kdf, Kem};
		use ohttp::SymmetricSuite;

		let config = ohttp::KeyConfig::new(
			1, Kem::K256Sha256, vec![SymmetricSuite::new(Kdf::HkdfSha256, Aead::ChaCha20Poly1305)],
		).unwrap();
		FakeDirectory {
			gateway: Mutex::new(ohttp::Server::new(config).unwrap()),
			mailboxes: Mutex::new(HashMap::new()),
			bodies: Mutex::new(Vec::new()),
			requests: Mutex::new(Vec::new()),
			unreachable: AtomicBool::new(false),
		}
	}

	pub fn url(&self) -> String {
		"https://directory.test".into()
	}

	pub fn relay(&self) -> String {
		"https://relay.test".into()
	}

	pub fn ohttp_keys(&self) -> OhttpKeys {
		let encoded = self.gateway.lock().config().encode().unwrap();
		OhttpKeys::decode(&encoded).unwrap()
	}

	pub fn directory(&self) -> Directory {
		Directory::new(self.url(), self.relay(), Some(self.ohttp_keys()))
	}

	pub fn bodies(&self) -> Vec<Vec<u8>> {
		self.bodies.lock().clone()
	}

	pub fn requests(&self) -> Vec<MailboxRequest> {
		self.requests.lock().clone()
	}

	pub fn nb_posts(&self) -> usize {
		self.requests.lock().iter().filter(|r| r.method == "POST").count()
	}

	fn serve(&self, method: &str, mailbox: &str, content: &[u8]) -> (u16, Vec<u8>) {
		let mut mailboxes = self.mailboxes.lock();
		match method {
			"POST" => {
				mailboxes.insert(mailbox.to_owned(), content.to_vec());
				(200, Vec::new())
			},
			"GET" => match mailboxes.get(mailbox) {
				Some(payload) => (200, payload.clone()),
				None => (202, Vec::new()),
			},
			_ => (404, Vec::new()),
		}
	}
}

#[async_trait]
impl Transport for FakeDirectory {
	async fn send(&self, req: &payjoin::Request) -> anyhow::Result<Vec<u8>> {
		if self.unreachable.load(Ordering::SeqCst) {
			bail!("connection refused: {}", req.url());
		}
		let body = req.body().to_vec();
		self.bodies.lock().push(body.clone());

		let (bhttp_req, res_ctx) = self.gateway.lock().decapsulate(&body)
			.map_err(|e| anyhow!("ohttp decapsulation failed: {}", e))?;
		let msg = bhttp::Message::read_bhttp(&mut std::io::Cursor::new(bhttp_req))
			.map_err(|e| anyhow!("invalid bhttp request: {}", e))?;
		let method = String::from_utf8_lossy(msg.control().method().unwrap_or_default()).into_owned();
		let path = String::from_utf8_lossy(msg.control().path().unwrap_or_default()).into_owned();
		let mailbox = path.trim_matches('/').rsplit('/').next().unwrap_or_default().to_owned();
		let content = msg.content().to_vec();

		let (status, payload) = self.serve(&method, &mailbox, &content);
		self.requests.lock().push(MailboxRequest { method, mailbox, content });

		let mut res = bhttp::Message::response(status);
		res.write_content(&payload);
		let mut bytes = Vec::new();
		res.write_bhttp(bhttp::Mode::KnownLength, &mut bytes)
			.map_err(|e| anyhow!("failed to write bhttp response: {}", e))?;
		bytes.resize(BHTTP_RES_BYTES, 0);
		res_ctx.encapsulate(&bytes).map_err(|e| anyhow!("ohttp encapsulation failed: {}", e))
	}
}
