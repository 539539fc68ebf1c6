//! Fee and amount bookkeeping on decoded PSBTs.

use std::collections::HashSet;

use anyhow::Context;
use bitcoin::{Amount, ScriptBuf, SignedAmount};

use crate::wallet::DecodedPsbt;


/// Maximum difference between the requested amount and the amount
/// the payjoin actually pays us before we log an error.
pub const AMOUNT_TOLERANCE: Amount = Amount::from_sat(10);

/// Convert a decimal BTC amount as reported by bitcoind into satoshis.
///
/// Digits beyond the eighth decimal are dropped, so the result is floored.
/// The conversion goes through the shortest decimal representation of the
/// float, so values like `0.29` don't lose a satoshi.
pub fn btc_to_sat(btc: f64) -> anyhow::Result<Amount> {
	ensure!(btc.is_finite(), "invalid btc amount: {}", btc);
	ensure!(btc >= 0.0, "negative btc amount: {}", btc);
	if btc == 0.0 {
		return Ok(Amount::ZERO);
	}

	let repr = btc.to_string();
	let (int, frac) = repr.split_once('.').unwrap_or((&repr, ""));
	let frac = format!("{:0<8}", &frac[..frac.len().min(8)]);

	let int = int.parse::<u64>().with_context(|| format!("invalid btc amount: {}", repr))?;
	let frac = frac.parse::<u64>().with_context(|| format!("invalid btc amount: {}", repr))?;
	let sat = int.checked_mul(100_000_000).and_then(|s| s.checked_add(frac))
		.with_context(|| format!("btc amount out of range: {}", repr))?;
	Ok(Amount::from_sat(sat))
}

fn sum(amounts: impl IntoIterator<Item = f64>) -> anyhow::Result<Amount> {
	amounts.into_iter().try_fold(Amount::ZERO, |acc, btc| {
		acc.checked_add(btc_to_sat(btc)?).context("amount overflow")
	})
}

fn signed(amount: Amount) -> anyhow::Result<SignedAmount> {
	amount.to_signed().context("amount out of range")
}

/// The total fee of the PSBT.
///
/// Uses the fee bitcoind declared if there is one, otherwise the difference
/// between the witness utxos of the inputs and the outputs.
pub fn extract_fee(psbt: &DecodedPsbt) -> anyhow::Result<Amount> {
	if let Some(fee) = psbt.fee {
		return btc_to_sat(fee);
	}

	let inputs = sum(psbt.inputs.iter().filter_map(|i| i.witness_utxo.as_ref().map(|u| u.amount)))?;
	let outputs = sum(psbt.outputs().iter().map(|o| o.value))?;
	inputs.checked_sub(outputs).context("psbt outputs exceed its known inputs")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverAmounts {
	pub total_fee: Amount,
	/// The part of the fee paid by the receiver, negative if the sender
	/// paid the receiver more than requested.
	pub receiver_fee: SignedAmount,
	pub receiver_in_amount: Amount,
	pub receiver_out_amount: Amount,
	/// What the payjoin effectively paid us: our outputs minus our inputs.
	pub calculated_amount: SignedAmount,
	/// The amount to store on the session.
	pub settled_amount: Amount,
	/// Whether the calculated amount was within [AMOUNT_TOLERANCE].
	pub within_tolerance: bool,
}

/// Work out the receiver side of a finalized payjoin.
///
/// Our inputs are those spending one of `candidate_scripts`, our outputs
/// those paying `session_address`.
pub fn reconcile_receiver_amounts(
	psbt: &DecodedPsbt,
	candidate_scripts: &[ScriptBuf],
	session_address: &str,
	requested: Amount,
) -> anyhow::Result<ReceiverAmounts> {
	let total_fee = extract_fee(psbt)?;

	let ours = candidate_scripts.iter().map(|s| s.to_hex_string()).collect::<HashSet<_>>();
	let receiver_in_amount = sum(psbt.inputs.iter()
		.filter_map(|i| i.witness_utxo.as_ref())
		.filter(|u| ours.contains(&u.script_pubkey.hex.to_lowercase()))
		.map(|u| u.amount)
	)?;
	let receiver_out_amount = sum(psbt.outputs().iter()
		.filter(|o| o.script_pubkey.address.as_deref() == Some(session_address))
		.map(|o| o.value)
	)?;

	let receiver_fee = signed(receiver_in_amount)? - signed(receiver_out_amount)? + signed(requested)?;
	let calculated_amount = signed(receiver_out_amount)? - signed(receiver_in_amount)?;

	let diff = (calculated_amount - signed(requested)?).abs();
	let within_tolerance = diff <= signed(AMOUNT_TOLERANCE)?;
	let settled_amount = if within_tolerance {
		requested
	} else {
		calculated_amount.to_unsigned()
			.with_context(|| format!("payjoin pays us a negative amount: {}", calculated_amount))?
	};

	Ok(ReceiverAmounts {
		total_fee,
		receiver_fee,
		receiver_in_amount,
		receiver_out_amount,
		calculated_amount,
		settled_amount,
		within_tolerance,
	})
}

#[derive(Debug, Clone, PartialEq)]
pub struct SenderAmounts {
	pub total_fee: Amount,
	pub sender_in_amount: Amount,
	pub sender_out_amount: Amount,
	/// Our inputs minus our outputs minus the payment.
	pub sender_fee: SignedAmount,
}

/// Work out the sender side of a payjoin, given the addresses our wallet owns.
pub fn reconcile_sender_amounts(
	psbt: &DecodedPsbt,
	owned_addresses: &HashSet<String>,
	amount: Amount,
) -> anyhow::Result<SenderAmounts> {
	let is_ours = |addr: &Option<String>| addr.as_ref().map(|a| owned_addresses.contains(a)).unwrap_or(false);

	let total_fee = extract_fee(psbt)?;
	let sender_in_amount = sum(psbt.inputs.iter()
		.filter_map(|i| i.witness_utxo.as_ref())
		.filter(|u| is_ours(&u.script_pubkey.address))
		.map(|u| u.amount)
	)?;
	let sender_out_amount = sum(psbt.outputs().iter()
		.filter(|o| is_ours(&o.script_pubkey.address))
		.map(|o| o.value)
	)?;
	let sender_fee = signed(sender_in_amount)? - signed(sender_out_amount)? - signed(amount)?;

	Ok(SenderAmounts { total_fee, sender_in_amount, sender_out_amount, sender_fee })
}
