//! An in-memory [WalletGateway] with fake signatures.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use bitcoin::{
	absolute, transaction, Address, Amount, FeeRate, Network, OutPoint, Psbt, Script, ScriptBuf,
	Sequence, Transaction, TxIn, TxOut, Txid, WPubkeyHash, Witness,
};
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::hashes::Hash;
use bitcoin::transaction::InputWeightPrediction;
use parking_lot::Mutex;

use super::*;


/// A witness of the same size as a real p2wpkh signature and pubkey.
pub fn fake_witness() -> Witness {
	Witness::from_slice(&[vec![0x30; 72], vec![0x02; 33]])
}

pub fn random_txid() -> Txid {
	Txid::from_byte_array(rand::random())
}

pub fn p2wpkh() -> ScriptBuf {
	ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(rand::random()))
}

/// A signed original PSBT spending one 100k sat input owned by
/// `sender_input`, paying `amount` to `payee` with change to a new script.
pub fn original_paying(payee: &ScriptBuf, amount: Amount, sender_input: ScriptBuf) -> Psbt {
	let tx = Transaction {
		version: transaction::Version::TWO,
		lock_time: absolute::LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint::new(random_txid(), 0),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			..Default::default()
		}],
		output: vec![
			TxOut { value: amount, script_pubkey: payee.clone() },
			TxOut { value: Amount::from_sat(99_000) - amount, script_pubkey: p2wpkh() },
		],
	};
	let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
	psbt.inputs[0].witness_utxo = Some(TxOut {
		value: Amount::from_sat(100_000),
		script_pubkey: sender_input,
	});
	psbt.inputs[0].final_script_witness = Some(fake_witness());
	psbt
}

#[derive(Default)]
struct State {
	owned: HashSet<ScriptBuf>,
	utxos: Vec<(OutPoint, TxOut)>,
	locked: Vec<OutPoint>,
	broadcast: Vec<Transaction>,
	fee_rates: HashMap<u16, FeeRate>,
	calls: Vec<&'static str>,
}

pub struct FakeWallet {
	network: Network,
	state: Mutex<State>,
	mempool_accept: AtomicBool,
	pub fail_lock_unspent: AtomicBool,
	pub fail_broadcast: AtomicBool,
}

impl FakeWallet {
	pub fn new(network: Network) -> FakeWallet {
		FakeWallet {
			network,
			state: Mutex::new(State::default()),
			mempool_accept: AtomicBool::new(true),
			fail_lock_unspent: AtomicBool::new(false),
			fail_broadcast: AtomicBool::new(false),
		}
	}

	fn call(&self, name: &'static str) {
		self.state.lock().calls.push(name);
	}

	pub fn calls(&self, name: &str) -> usize {
		self.state.lock().calls.iter().filter(|c| **c == name).count()
	}

	pub fn new_owned_address(&self) -> Address {
		let spk = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(rand::random()));
		self.state.lock().owned.insert(spk.clone());
		Address::from_script(&spk, self.network).unwrap()
	}

	pub fn is_owned(&self, script: &Script) -> bool {
		self.state.lock().owned.contains(script)
	}

	/// Give the wallet a confirmed utxo.
	pub fn add_utxo(&self, amount: Amount) -> (OutPoint, TxOut) {
		let addr = self.new_owned_address();
		let utxo = (
			OutPoint::new(random_txid(), 0),
			TxOut { value: amount, script_pubkey: addr.script_pubkey() },
		);
		self.state.lock().utxos.push(utxo.clone());
		utxo
	}

	pub fn set_mempool_accept(&self, allowed: bool) {
		self.mempool_accept.store(allowed, Ordering::SeqCst);
	}

	pub fn set_fee_rate(&self, conf_target: u16, fee_rate: FeeRate) {
		self.state.lock().fee_rates.insert(conf_target, fee_rate);
	}

	pub fn locked(&self) -> Vec<OutPoint> {
		self.state.lock().locked.clone()
	}

	pub fn broadcast(&self) -> Vec<Transaction> {
		self.state.lock().broadcast.clone()
	}

	fn script_info(&self, spk: &Script) -> ScriptPubKeyInfo {
		ScriptPubKeyInfo {
			hex: spk.to_hex_string(),
			address: Address::from_script(spk, self.network).ok().map(|a| a.to_string()),
		}
	}

	fn decode_tx(&self, tx: &Transaction) -> DecodedTx {
		DecodedTx {
			txid: tx.compute_txid(),
			vout: tx.output.iter().enumerate().map(|(n, o)| DecodedTxOut {
				value: o.value.to_btc(),
				n: n as u32,
				script_pubkey: self.script_info(&o.script_pubkey),
			}).collect(),
		}
	}
}

#[async_trait]
impl WalletGateway for FakeWallet {
	async fn decode_raw_transaction(&self, tx_hex: &str) -> anyhow::Result<DecodedTx> {
		self.call("decode_raw_transaction");
		let tx = deserialize_hex::<Transaction>(tx_hex)?;
		Ok(self.decode_tx(&tx))
	}

	async fn get_fee_rate(&self, conf_target: u16) -> anyhow::Result<FeeRate> {
		self.call("get_fee_rate");
		Ok(self.state.lock().fee_rates.get(&conf_target).copied()
			.unwrap_or(FeeRate::from_sat_per_vb_unchecked(2)))
	}

	async fn list_unspent(&self, _wallet: &str, _min_conf: u32) -> anyhow::Result<Vec<Utxo>> {
		self.call("list_unspent");
		let state = self.state.lock();
		Ok(state.utxos.iter().filter(|(o, _)| !state.locked.contains(o)).map(|(o, txout)| Utxo {
			txid: o.txid,
			vout: o.vout,
			address: Address::from_script(&txout.script_pubkey, self.network).ok().map(|a| a.to_string()),
			script_pubkey: txout.script_pubkey.to_hex_string(),
			amount: txout.value.to_btc(),
			confirmations: 6,
			spendable: true,
			safe: true,
		}).collect())
	}

	async fn decode_script(&self, script: &Script) -> anyhow::Result<ScriptInfo> {
		self.call("decode_script");
		Ok(ScriptInfo {
			address: Address::from_script(script, self.network).ok().map(|a| a.to_string()),
		})
	}

	async fn get_address_info(&self, address: &str, _wallet: &str) -> anyhow::Result<AddressInfo> {
		self.call("get_address_info");
		let addr = Address::from_str(address)?.require_network(self.network)?;
		Ok(AddressInfo { ismine: self.is_owned(&addr.script_pubkey()) })
	}

	async fn test_mempool_accept(&self, tx_hex: &str) -> anyhow::Result<Vec<MempoolAcceptResult>> {
		self.call("test_mempool_accept");
		let tx = deserialize_hex::<Transaction>(tx_hex)?;
		let allowed = self.mempool_accept.load(Ordering::SeqCst);
		Ok(vec![MempoolAcceptResult {
			txid: tx.compute_txid(),
			allowed,
			reject_reason: if allowed { None } else { Some("missing-inputs".into()) },
		}])
	}

	async fn process_psbt(
		&self,
		psbt: &str,
		sign: bool,
		finalize: bool,
		_wallet: &str,
	) -> anyhow::Result<ProcessedPsbt> {
		self.call("process_psbt");
		let mut psbt = Psbt::from_str(psbt)?;
		if sign && finalize {
			for input in psbt.inputs.iter_mut() {
				let ours = input.witness_utxo.as_ref()
					.map(|u| self.is_owned(&u.script_pubkey))
					.unwrap_or(false);
				if ours && input.final_script_witness.is_none() {
					input.final_script_witness = Some(fake_witness());
					input.partial_sigs.clear();
					input.bip32_derivation.clear();
				}
			}
		}
		let complete = psbt.inputs.iter()
			.all(|i| i.final_script_witness.is_some() || i.final_script_sig.is_some());
		Ok(ProcessedPsbt { psbt: psbt.to_string(), complete })
	}

	async fn finalize_psbt(&self, psbt: &str) -> anyhow::Result<FinalizedPsbt> {
		self.call("finalize_psbt");
		let psbt = Psbt::from_str(psbt)?;
		let complete = psbt.inputs.iter()
			.all(|i| i.final_script_witness.is_some() || i.final_script_sig.is_some());
		if complete {
			let tx = psbt.extract_tx_unchecked_fee_rate();
			Ok(FinalizedPsbt { psbt: None, hex: Some(serialize_hex(&tx)), complete })
		} else {
			Ok(FinalizedPsbt { psbt: Some(psbt.to_string()), hex: None, complete })
		}
	}

	async fn send_raw_transaction(&self, tx_hex: &str, _wallet: &str) -> anyhow::Result<Txid> {
		self.call("send_raw_transaction");
		if self.fail_broadcast.load(Ordering::SeqCst) {
			bail!("bad-txns-inputs-missingorspent");
		}
		let tx = deserialize_hex::<Transaction>(tx_hex)?;
		let txid = tx.compute_txid();
		self.state.lock().broadcast.push(tx);
		Ok(txid)
	}

	async fn lock_unspent(&self, utxos: &[OutPoint], _wallet: &str) -> anyhow::Result<bool> {
		self.call("lock_unspent");
		if self.fail_lock_unspent.load(Ordering::SeqCst) {
			bail!("Invalid parameter, unknown transaction");
		}
		self.state.lock().locked.extend_from_slice(utxos);
		Ok(true)
	}

	async fn decode_psbt(&self, psbt: &str) -> anyhow::Result<DecodedPsbt> {
		self.call("decode_psbt");
		let psbt = Psbt::from_str(psbt)?;
		Ok(DecodedPsbt {
			tx: self.decode_tx(&psbt.unsigned_tx),
			inputs: psbt.inputs.iter().map(|i| DecodedPsbtInput {
				witness_utxo: i.witness_utxo.as_ref().map(|u| WitnessUtxo {
					amount: u.value.to_btc(),
					script_pubkey: self.script_info(&u.script_pubkey),
				}),
			}).collect(),
			fee: psbt.fee().ok().map(|f| f.to_btc()),
		})
	}

	async fn get_new_address(&self, _wallet: &str) -> anyhow::Result<String> {
		self.call("get_new_address");
		Ok(self.new_owned_address().to_string())
	}

	async fn create_funded_psbt(
		&self,
		_wallet: &str,
		address: &str,
		amount: Amount,
		fee_rate: FeeRate,
	) -> anyhow::Result<String> {
		self.call("create_funded_psbt");
		let payee = Address::from_str(address)?.require_network(self.network)?;
		let change = self.new_owned_address();

		let utxos = {
			let state = self.state.lock();
			state.utxos.iter().filter(|(o, _)| !state.locked.contains(o)).cloned().collect::<Vec<_>>()
		};
		let weight = transaction::predict_weight(
			utxos.iter().map(|_| InputWeightPrediction::P2WPKH_MAX),
			[payee.script_pubkey().len(), change.script_pubkey().len()],
		);
		let fee = fee_rate.checked_mul_by_weight(weight).context("fee overflow")?;
		let total = utxos.iter().map(|(_, u)| u.value).sum::<Amount>();
		let change_value = total.checked_sub(amount + fee).context("insufficient funds")?;

		let tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: utxos.iter().map(|(o, _)| TxIn {
				previous_output: *o,
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
				witness: Witness::new(),
			}).collect(),
			output: vec![
				TxOut { value: amount, script_pubkey: payee.script_pubkey() },
				TxOut { value: change_value, script_pubkey: change.script_pubkey() },
			],
		};
		let mut psbt = Psbt::from_unsigned_tx(tx)?;
		for (input, (_, utxo)) in psbt.inputs.iter_mut().zip(utxos.iter()) {
			input.witness_utxo = Some(utxo.clone());
		}
		Ok(psbt.to_string())
	}
}
