use crate::errors::ApiError;
use base64::Engine;
use chrono::Utc;
use club_core::types::{CiphertextHandle, LedgerRecord, MemberAddress, RecordId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};
use std::str::FromStr;

pub type Db = Pool<Sqlite>;

pub async fn connect(db_url: &str, max_connections: u32) -> Result<Db, ApiError> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(|_| ApiError::Config(format!("invalid database url {db_url}")))?
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|_| ApiError::Internal)
}

pub async fn init_schema(db: &Db) -> Result<(), ApiError> {
    // Append-only ledger: rows are inserted once, and the only update is the one-way verification flip.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS investments (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  description TEXT NOT NULL,
  creator TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  risk_level INTEGER NOT NULL,
  public_signal INTEGER NOT NULL,
  amount_handle TEXT NOT NULL,
  is_verified INTEGER NOT NULL DEFAULT 0,
  clear_amount INTEGER
);

CREATE TABLE IF NOT EXISTS ciphertexts (
  handle TEXT PRIMARY KEY,
  contract TEXT NOT NULL,
  owner TEXT NOT NULL,
  ciphertext_b64 TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
  tx_hash TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  record_id TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at TEXT NOT NULL
);
"#,
    )
    .execute(db)
    .await
    .map_err(|_| ApiError::Internal)?;

    Ok(())
}

pub async fn ping(db: &Db) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(db).await.map(|_| ())
}

pub async fn record_exists(db: &Db, id: &RecordId) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(r#"SELECT COUNT(*) AS c FROM investments WHERE id = ?"#)
        .bind(id.as_str())
        .fetch_one(db)
        .await?;
    let c: i64 = row.get("c");
    Ok(c > 0)
}

pub async fn list_record_ids(db: &Db) -> Result<Vec<RecordId>, sqlx::Error> {
    let rows = sqlx::query(r#"SELECT id FROM investments ORDER BY seq"#)
        .fetch_all(db)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| RecordId::new(row.get::<String, _>(0)))
        .collect())
}

pub async fn get_record(db: &Db, id: &RecordId) -> Result<Option<LedgerRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT name, description, creator, created_at, risk_level, public_signal, is_verified, clear_amount
           FROM investments WHERE id = ?"#,
    )
    .bind(id.as_str())
    .fetch_optional(db)
    .await?;

    let Some(row) = row else { return Ok(None); };

    let creator: String = row.get(2);
    let risk_level: i64 = row.get(4);
    let public_signal: i64 = row.get(5);
    let is_verified: i64 = row.get(6);
    let clear_amount: Option<i64> = row.get(7);

    Ok(Some(LedgerRecord {
        name: row.get(0),
        description: row.get(1),
        creator: MemberAddress::new(creator),
        created_at: row.get(3),
        risk_level: risk_level as u8,
        public_signal: public_signal as u32,
        is_verified: is_verified == 1,
        clear_amount: clear_amount.map(|v| v as u64),
    }))
}

pub async fn get_amount_handle(db: &Db, id: &RecordId) -> Result<Option<CiphertextHandle>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT amount_handle FROM investments WHERE id = ?"#)
        .bind(id.as_str())
        .fetch_optional(db)
        .await?;
    Ok(row.map(|row| CiphertextHandle::new(row.get::<String, _>(0))))
}

/// (contract, ciphertext bytes) stored under `handle`.
pub async fn get_ciphertext(db: &Db, handle: &CiphertextHandle) -> Result<Option<(String, Vec<u8>)>, ApiError> {
    let row = sqlx::query(r#"SELECT contract, ciphertext_b64 FROM ciphertexts WHERE handle = ?"#)
        .bind(handle.as_str())
        .fetch_optional(db)
        .await
        .map_err(|_| ApiError::Internal)?;

    let Some(row) = row else { return Ok(None); };
    let contract: String = row.get(0);
    let b64: String = row.get(1);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|_| ApiError::Internal)?;
    Ok(Some((contract, bytes)))
}

pub struct NewRecordRow<'a> {
    pub id: &'a RecordId,
    pub name: &'a str,
    pub description: &'a str,
    pub creator: &'a MemberAddress,
    pub risk_level: u8,
    pub public_signal: u32,
    pub handle: &'a CiphertextHandle,
    pub contract: &'a str,
    pub ciphertext: &'a [u8],
}

/// Insert a record, its ciphertext and the confirming transaction in one database transaction.
pub async fn insert_record(db: &Db, row: NewRecordRow<'_>, tx_hash: &str) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;

    sqlx::query(
        r#"INSERT INTO ciphertexts (handle, contract, owner, ciphertext_b64)
           VALUES (?, ?, ?, ?)"#,
    )
    .bind(row.handle.as_str())
    .bind(row.contract)
    .bind(row.creator.as_str())
    .bind(base64::engine::general_purpose::STANDARD.encode(row.ciphertext))
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"INSERT INTO investments
           (id, name, description, creator, created_at, risk_level, public_signal, amount_handle, is_verified)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)"#,
    )
    .bind(row.id.as_str())
    .bind(row.name)
    .bind(row.description)
    .bind(row.creator.as_str())
    .bind(Utc::now().timestamp())
    .bind(row.risk_level as i64)
    .bind(row.public_signal as i64)
    .bind(row.handle.as_str())
    .execute(&mut *tx)
    .await?;

    insert_confirmed_tx(&mut tx, tx_hash, "create", row.id).await?;
    tx.commit().await
}

/// Flip a record to verified. Returns false if it was already verified (or does not exist).
pub async fn mark_verified(db: &Db, id: &RecordId, clear_amount: i64, tx_hash: &str) -> Result<bool, sqlx::Error> {
    let mut tx = db.begin().await?;

    let updated = sqlx::query(
        r#"UPDATE investments SET is_verified = 1, clear_amount = ?
           WHERE id = ? AND is_verified = 0"#,
    )
    .bind(clear_amount)
    .bind(id.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated != 1 {
        tx.rollback().await?;
        return Ok(false);
    }

    insert_confirmed_tx(&mut tx, tx_hash, "verify", id).await?;
    tx.commit().await?;
    Ok(true)
}

async fn insert_confirmed_tx(
    tx: &mut Transaction<'_, Sqlite>,
    tx_hash: &str,
    kind: &str,
    record_id: &RecordId,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO transactions (tx_hash, kind, record_id, status, created_at)
           VALUES (?, ?, ?, 'confirmed', ?)"#,
    )
    .bind(tx_hash)
    .bind(kind)
    .bind(record_id.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn tx_status(db: &Db, tx_hash: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT status FROM transactions WHERE tx_hash = ?"#)
        .bind(tx_hash)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|row| row.get(0)))
}
