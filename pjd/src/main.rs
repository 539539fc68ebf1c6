
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use bitcoin::{Amount, Txid};
use chrono::Utc;
use clap::Parser;
use log::{error, info};

use pjd::{Config, Pjd};
use pjd::service::{ReceiveInfo, SendInfo};
use pjd_log::{RecordSerializeWrapper, SLOG_FILENAME};

#[derive(Parser)]
#[command(name = "pjd", version, about)]
struct Cli {
	/// Path to the configuration file
	#[arg(global = true, short = 'C', long)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
	/// Run the session scheduler
	#[command()]
	Start,

	/// Request a payjoin payment
	#[command()]
	Receive {
		/// The amount to receive in sats
		#[arg(long)]
		amount: u64,
		/// The address to receive on, a new one from the receive wallet if empty
		#[arg(long)]
		address: Option<String>,
		/// Url we post to when the payment shows up
		#[arg(long)]
		callback_url: Option<String>,
	},

	/// Cancel a receive session
	#[command()]
	CancelReceive {
		id: i64,
	},

	/// Pay a bip21 uri with a payjoin endpoint
	#[command()]
	Send {
		bip21: String,
		/// Url we post to when the payment confirms
		#[arg(long)]
		callback_url: Option<String>,
	},

	/// Cancel a send session
	#[command()]
	CancelSend {
		id: i64,
	},

	/// Show a send session
	#[command()]
	GetSend {
		id: i64,
	},

	/// Show a receive session
	#[command()]
	GetReceive {
		id: i64,
	},

	/// Report a transaction paying a watched address
	#[command()]
	AddressEvent {
		address: String,
		txid: Txid,
		confirmations: u32,
	},

	/// Report confirmations of a sent transaction
	#[command()]
	TxEvent {
		txid: Txid,
		confirmations: u32,
	},

	/// Print the configuration in use
	#[command()]
	DumpConfig,
}

#[tokio::main]
async fn main() {
	// Set a custom panic hook to make sure we print stack traces
	// when one of our background processes panic.
	std::panic::set_hook(Box::new(|panic_info| {
		let backtrace = std::backtrace::Backtrace::force_capture();
		eprintln!("Panic occurred: {}\n\nBacktrace:\n{}", panic_info, backtrace);
	}));

	if let Err(e) = inner_main().await {
		eprintln!("An error occurred: {}", e);
		eprintln!("");
		eprintln!("{:?}", e);
		process::exit(1);
	}
}

fn init_logging(level: log::LevelFilter, slog_dir: Option<&Path>) -> anyhow::Result<()> {
	let mut dispatch = fern::Dispatch::new()
		.level(level)
		.level_for("rustls", log::LevelFilter::Warn)
		.level_for("bitcoincore_rpc", log::LevelFilter::Warn)
		.level_for("tokio_postgres", log::LevelFilter::Info)
		.level_for("hyper_util", log::LevelFilter::Info)
		.level_for("reqwest", log::LevelFilter::Info)
		// regular logging dispatch
		.chain(fern::Dispatch::new()
			.format(|out, msg, rec| {
				let stamp = chrono::Local::now().to_rfc3339();
				let kv = if rec.key_values().count() > 0 {
					serde_json::to_string(&pjd_log::SourceSerializeWrapper(rec.key_values()))
						.map(|s| format!(" -- {}", s))
						.unwrap_or_default()
				} else {
					String::new()
				};
				out.finish(format_args!(
					"[{} {: >5} {}] {}{}",
					stamp, rec.level(), rec.module_path().unwrap_or(""), msg, kv,
				))
			})
			.chain(std::io::stderr())
		);

	if let Some(dir) = slog_dir {
		// structured logging dispatch
		let slog_file = fern::log_file(dir.join(SLOG_FILENAME))
			.with_context(|| format!("failed to open log file in {}", dir.display()))?;
		dispatch = dispatch.chain(fern::Dispatch::new()
			.filter(|m| m.target() == pjd_log::SLOG_TARGET)
			.format(|out, _msg, rec| {
				#[derive(serde::Serialize)]
				struct Rec<'a> {
					timestamp: chrono::DateTime<chrono::Local>,
					#[serde(flatten)]
					rec: RecordSerializeWrapper<'a>,
				}
				let rec = Rec {
					timestamp: chrono::Local::now(),
					rec: RecordSerializeWrapper(rec),
				};
				if let Ok(line) = serde_json::to_string(&rec) {
					out.finish(format_args!("{}", line));
				}
			})
			.chain(slog_file)
		);
	}

	dispatch.apply().context("error setting up logging")?;
	Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
	serde_json::to_writer_pretty(std::io::stdout(), value).context("failed to write output")?;
	println!("");
	Ok(())
}

async fn inner_main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let cfg = Config::load(cli.config.as_deref())?;
	cfg.validate().context("invalid configuration")?;

	if let Command::DumpConfig = cli.command {
		cfg.write_into(&mut std::io::stdout())?;
		return Ok(());
	}

	init_logging(cfg.log_level, cfg.log_dir.as_deref())?;
	info!("Running with config: {:#?}", cfg);

	let pjd = Pjd::open(cfg).await?;
	let svc = pjd.service();
	match cli.command {
		Command::DumpConfig => unreachable!(),
		Command::Start => {
			if let Err(e) = pjd.run().await {
				error!("Shutdown error from pjd {:?}", e);
				process::exit(1);
			}
		},
		Command::Receive { amount, address, callback_url } => {
			let s = svc.receive(address.as_deref(), Amount::from_sat(amount), callback_url).await?;
			print_json(&ReceiveInfo::new(&s, Utc::now()))?;
		},
		Command::CancelReceive { id } => {
			let s = svc.cancel_receive(id).await?;
			print_json(&ReceiveInfo::new(&s, Utc::now()))?;
		},
		Command::Send { bip21, callback_url } => {
			let s = svc.send(&bip21, callback_url).await?;
			print_json(&SendInfo::new(&s, Utc::now()))?;
		},
		Command::CancelSend { id } => {
			let s = svc.cancel_send(id).await?;
			print_json(&SendInfo::new(&s, Utc::now()))?;
		},
		Command::GetSend { id } => print_json(&svc.get_send(id).await?)?,
		Command::GetReceive { id } => print_json(&svc.get_receive(id).await?)?,
		Command::AddressEvent { address, txid, confirmations } => {
			let s = svc.handle_address_event(&address, txid, confirmations).await?;
			print_json(&ReceiveInfo::new(&s, Utc::now()))?;
		},
		Command::TxEvent { txid, confirmations } => {
			let s = svc.handle_tx_event(txid, confirmations).await?;
			print_json(&SendInfo::new(&s, Utc::now()))?;
		},
	}

	Ok(())
}
