mod embedded {
	use refinery::embed_migrations;
	embed_migrations!("src/database/migrations");
}

pub mod model;


use anyhow::Context;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use tokio_postgres::{types::Type, Client, NoTls};

use crate::config::Postgres as PostgresConfig;
use crate::repository::{Partition, SessionRepository};
use self::model::{NewReceiveSession, NewSendSession, ReceiveSession, SeenInput, SendSession};

const DEFAULT_DATABASE: &str = "postgres";

const RECEIVE_COLUMNS: &str = "id, address, bip21, amount, session, callback_url, expiry_at, \
	created_at, first_seen_at, confirmed_at, cancelled_at, failed_at, fallback_at, \
	non_payjoin_at, called_back_at, txid, fallback_tx_hex, fee, receiver_fee, \
	receiver_in_amount, receiver_out_amount";

const SEND_COLUMNS: &str = "id, address, bip21, amount, session, callback_url, expiry_at, \
	created_at, confirmed_at, cancelled_at, called_back_at, txid, fee, sender_fee";

/// Postgres uses signed integers, our amounts never exceed 21M BTC.
fn sat(amount: bitcoin::Amount) -> i64 {
	amount.to_sat() as i64
}

#[derive(Clone)]
pub struct Db {
	pool: Pool<PostgresConnectionManager<NoTls>>
}

impl Db {
	async fn run_migrations(&self) -> anyhow::Result<()> {
		let mut conn = self.pool.get().await?;
		embedded::migrations::runner().run_async::<Client>(&mut conn).await?;
		info!("All migrations got successfully run");
		Ok(())
	}

	pub(crate) fn config(database: &str, config: &PostgresConfig) -> tokio_postgres::Config {
		let mut pg_config = tokio_postgres::Config::new();
		pg_config.host(&config.host);
		pg_config.port(config.port);
		pg_config.dbname(database);
		if let Some(user) = &config.user {
			pg_config.user(user);
		}
		if let Some(password) = &config.password {
			pg_config.password(password);
		}

		pg_config
	}

	pub(crate) async fn pool_connect(
		database: &str,
		postgres_config: &PostgresConfig,
	) -> anyhow::Result<Pool<PostgresConnectionManager<NoTls>>> {
		let config = Self::config(database, postgres_config);

		let manager = PostgresConnectionManager::new(config, NoTls);
		Ok(Pool::builder().build(manager).await?)
	}

	async fn database_exists(config: &PostgresConfig) -> anyhow::Result<bool> {
		let pool = Self::pool_connect(DEFAULT_DATABASE, config).await?;
		let conn = pool.get().await?;
		let row = conn.query_opt(
			"SELECT 1 FROM pg_database WHERE datname = $1", &[&config.name],
		).await?;
		Ok(row.is_some())
	}

	pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
		let pool = Self::pool_connect(&config.name, config).await?;

		let db = Db { pool };
		db.run_migrations().await?;

		Ok(db)
	}

	/// Connect to the database, creating it first if it doesn't exist.
	pub async fn create(config: &PostgresConfig) -> anyhow::Result<Self> {
		info!("Checking if the database exists...");
		if Self::database_exists(config).await? {
			info!("Database {} already exists", config.name);
		} else {
			info!("No database set up yet, creating a new one.");
			let pool = Self::pool_connect(DEFAULT_DATABASE, config).await?;
			let conn = pool.get().await?;

			let statement = conn.prepare(
				&format!("CREATE DATABASE \"{}\"", config.name)
			).await?;
			conn.execute(&statement, &[]).await?;
		}

		Self::connect(config).await
	}

	async fn query_receive(
		&self,
		filter: &str,
		types: &[Type],
		params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
	) -> anyhow::Result<Vec<ReceiveSession>> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed(
			&format!("SELECT {} FROM receive_session WHERE {} ORDER BY id", RECEIVE_COLUMNS, filter),
			types,
		).await?;
		let rows = conn.query(&statement, params).await?;
		rows.into_iter().map(ReceiveSession::try_from).collect()
	}

	async fn query_send(
		&self,
		filter: &str,
		types: &[Type],
		params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
	) -> anyhow::Result<Vec<SendSession>> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed(
			&format!("SELECT {} FROM send_session WHERE {} ORDER BY id", SEND_COLUMNS, filter),
			types,
		).await?;
		let rows = conn.query(&statement, params).await?;
		rows.into_iter().map(SendSession::try_from).collect()
	}
}

#[async_trait]
impl SessionRepository for Db {
	/**
	 * Receive sessions
	*/

	async fn create_receive_session(&self, new: NewReceiveSession) -> anyhow::Result<ReceiveSession> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare(&format!("
			INSERT INTO receive_session (address, bip21, amount, session, callback_url, expiry_at)
			VALUES ($1, $2, $3, $4, $5, $6)
			RETURNING {}
		", RECEIVE_COLUMNS)).await?;

		let row = conn.query_one(&statement, &[
			&new.address,
			&new.bip21,
			&sat(new.amount),
			&new.session,
			&new.callback_url,
			&new.expiry_at,
		]).await?;
		ReceiveSession::try_from(row)
	}

	async fn get_receive_session(&self, id: i64) -> anyhow::Result<Option<ReceiveSession>> {
		Ok(self.query_receive("id = $1", &[Type::INT8], &[&id]).await?.pop())
	}

	async fn get_receive_session_by_address(
		&self,
		address: &str,
	) -> anyhow::Result<Option<ReceiveSession>> {
		Ok(self.query_receive("address = $1", &[Type::TEXT], &[&address]).await?.pop())
	}

	async fn list_active_receive_sessions(
		&self,
		partition: Partition,
		now: DateTime<Utc>,
	) -> anyhow::Result<Vec<ReceiveSession>> {
		self.query_receive("
			txid IS NULL AND confirmed_at IS NULL AND cancelled_at IS NULL
				AND expiry_at > $1 AND id % $2 = $3
		", &[Type::TIMESTAMPTZ, Type::INT8, Type::INT8], &[
			&now,
			&(partition.total_replicas as i64),
			&(partition.replica_id as i64 - 1),
		]).await
	}

	async fn list_fallback_candidates(
		&self,
		partition: Partition,
		failed_before: DateTime<Utc>,
	) -> anyhow::Result<Vec<ReceiveSession>> {
		self.query_receive("
			txid IS NULL AND fallback_tx_hex IS NOT NULL
				AND confirmed_at IS NULL AND cancelled_at IS NULL
				AND failed_at < $1 AND id % $2 = $3
		", &[Type::TIMESTAMPTZ, Type::INT8, Type::INT8], &[
			&failed_before,
			&(partition.total_replicas as i64),
			&(partition.replica_id as i64 - 1),
		]).await
	}

	async fn update_receive_session(&self, s: &ReceiveSession) -> anyhow::Result<()> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare("
			UPDATE receive_session SET
				amount = $2, session = $3, first_seen_at = $4, confirmed_at = $5,
				cancelled_at = $6, failed_at = $7, fallback_at = $8, non_payjoin_at = $9,
				called_back_at = $10, txid = $11, fallback_tx_hex = $12, fee = $13,
				receiver_fee = $14, receiver_in_amount = $15, receiver_out_amount = $16
			WHERE id = $1
		").await?;

		let updated = conn.execute(&statement, &[
			&s.id,
			&sat(s.amount),
			&s.session,
			&s.first_seen_at,
			&s.confirmed_at,
			&s.cancelled_at,
			&s.failed_at,
			&s.fallback_at,
			&s.non_payjoin_at,
			&s.called_back_at,
			&s.txid.map(|t| t.to_string()),
			&s.fallback_tx_hex,
			&s.fee.map(sat),
			&s.receiver_fee.map(|a| a.to_sat()),
			&s.receiver_in_amount.map(sat),
			&s.receiver_out_amount.map(sat),
		]).await?;
		ensure!(updated == 1, "receive session {} doesn't exist", s.id);
		Ok(())
	}

	async fn mark_receive_failed(&self, id: i64, at: DateTime<Utc>) -> anyhow::Result<()> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare("
			UPDATE receive_session SET failed_at = $2 WHERE id = $1 AND failed_at IS NULL
		").await?;
		conn.execute(&statement, &[&id, &at]).await?;
		Ok(())
	}

	/**
	 * Send sessions
	*/

	async fn create_send_session(&self, new: NewSendSession) -> anyhow::Result<SendSession> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare(&format!("
			INSERT INTO send_session (address, bip21, amount, session, callback_url, expiry_at)
			VALUES ($1, $2, $3, $4, $5, $6)
			RETURNING {}
		", SEND_COLUMNS)).await?;

		let row = conn.query_one(&statement, &[
			&new.address,
			&new.bip21,
			&sat(new.amount),
			&new.session,
			&new.callback_url,
			&new.expiry_at,
		]).await?;
		SendSession::try_from(row)
	}

	async fn get_send_session(&self, id: i64) -> anyhow::Result<Option<SendSession>> {
		Ok(self.query_send("id = $1", &[Type::INT8], &[&id]).await?.pop())
	}

	async fn get_send_session_by_txid(&self, txid: Txid) -> anyhow::Result<Option<SendSession>> {
		Ok(self.query_send("txid = $1", &[Type::TEXT], &[&txid.to_string()]).await?.pop())
	}

	async fn list_active_send_sessions(
		&self,
		partition: Partition,
		now: DateTime<Utc>,
	) -> anyhow::Result<Vec<SendSession>> {
		self.query_send("
			txid IS NULL AND confirmed_at IS NULL AND cancelled_at IS NULL
				AND expiry_at > $1 AND id % $2 = $3
		", &[Type::TIMESTAMPTZ, Type::INT8, Type::INT8], &[
			&now,
			&(partition.total_replicas as i64),
			&(partition.replica_id as i64 - 1),
		]).await
	}

	async fn update_send_session(&self, s: &SendSession) -> anyhow::Result<()> {
		let conn = self.pool.get().await?;
		let statement = conn.prepare("
			UPDATE send_session SET
				session = $2, confirmed_at = $3, cancelled_at = $4, called_back_at = $5,
				txid = $6, fee = $7, sender_fee = $8
			WHERE id = $1
		").await?;

		let updated = conn.execute(&statement, &[
			&s.id,
			&s.session,
			&s.confirmed_at,
			&s.cancelled_at,
			&s.called_back_at,
			&s.txid.map(|t| t.to_string()),
			&s.fee.map(sat),
			&s.sender_fee.map(|a| a.to_sat()),
		]).await?;
		ensure!(updated == 1, "send session {} doesn't exist", s.id);
		Ok(())
	}

	/**
	 * Seen inputs
	*/

	async fn list_seen_inputs(&self) -> anyhow::Result<Vec<SeenInput>> {
		let conn = self.pool.get().await?;
		let rows = conn.query("SELECT outpoint, bip21 FROM seen_input", &[]).await?;
		rows.into_iter().map(SeenInput::try_from).collect()
	}

	async fn store_seen_inputs(&self, inputs: &[OutPoint], bip21: &str) -> anyhow::Result<()> {
		if inputs.is_empty() {
			return Ok(());
		}

		let conn = self.pool.get().await?;
		let statement = conn.prepare_typed("
			INSERT INTO seen_input (outpoint, bip21)
			SELECT UNNEST($1), $2
			ON CONFLICT (outpoint) DO NOTHING
		", &[Type::TEXT_ARRAY, Type::TEXT]).await?;

		let outpoints = inputs.iter().map(|o| o.to_string()).collect::<Vec<_>>();
		conn.execute(&statement, &[&outpoints, &bip21]).await
			.context("failed to store seen inputs")?;
		Ok(())
	}
}
