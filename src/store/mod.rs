//! Holdings are the only thing this crate persists. One row per coin identifier, ordered by
//! insertion. Quotes are never written here.
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use derive_more::Display;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS holdings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    coin_id TEXT NOT NULL UNIQUE,
    name TEXT,
    symbol TEXT,
    quantity REAL NOT NULL,
    created_at INTEGER NOT NULL
);";

const SELECT_COLUMNS: &str = "SELECT coin_id, name, symbol, quantity, created_at FROM holdings";

#[derive(Debug, Display)]
pub enum StoreError {
    #[display("validation error: {_0}")]
    Validation(String),
    #[display("no holding for coin {_0}")]
    NotFound(String),
    #[display("database error: {_0}")]
    Database(rusqlite::Error),
    #[display("io error: {_0}")]
    Io(std::io::Error),
    #[display("holdings store lock poisoned")]
    Poisoned,
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        StoreError::Database(value)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Holding {
    pub coin_id: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub quantity: f64,
    pub created_at: i64,
}

impl Holding {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            coin_id: row.get(0)?,
            name: row.get(1)?,
            symbol: row.get(2)?,
            quantity: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

/// Identifiers are matched case-insensitively and without surrounding whitespace, as the upstream
/// identifier space is lower-case.
pub fn normalize_coin_id(coin_id: &str) -> String {
    coin_id.trim().to_lowercase()
}

fn validate_coin_id(coin_id: &str) -> Result<String, StoreError> {
    let coin_id = normalize_coin_id(coin_id);
    if coin_id.is_empty() {
        return Err(StoreError::Validation("coin id must not be empty".into()));
    }
    Ok(coin_id)
}

fn validate_quantity(quantity: f64) -> Result<f64, StoreError> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(StoreError::Validation(format!(
            "quantity must be a positive number, got {quantity}"
        )));
    }
    Ok(quantity)
}

fn clean_label(label: Option<&str>) -> Option<String> {
    label.map(str::trim).filter(|l| !l.is_empty()).map(String::from)
}

pub struct HoldingsStore {
    conn: Mutex<Connection>,
}

impl HoldingsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
        }

        log::info!("Opening holdings store at {}", path.display());
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn create(&self, coin_id: &str, quantity: f64) -> Result<Holding, StoreError> {
        self.create_labeled(coin_id, quantity, None, None)
    }

    /// Adding a coin that is already held merges: the quantities are summed and the holding keeps
    /// its original position. Labels are only replaced when new ones are given. A sum that is no
    /// longer finite is rejected and the stored holding is left as it was.
    pub fn create_labeled(
        &self,
        coin_id: &str,
        quantity: f64,
        name: Option<&str>,
        symbol: Option<&str>,
    ) -> Result<Holding, StoreError> {
        let coin_id = validate_coin_id(coin_id)?;
        let quantity = validate_quantity(quantity)?;
        let name = clean_label(name);
        let symbol = clean_label(symbol).map(|s| s.to_lowercase());
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let held: Option<f64> = tx
            .query_row(
                "SELECT quantity FROM holdings WHERE coin_id = ?1",
                params![coin_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(held) = held {
            validate_quantity(held + quantity)?;
        }
        tx.execute(
            "INSERT INTO holdings (coin_id, name, symbol, quantity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(coin_id) DO UPDATE SET
                quantity = quantity + excluded.quantity,
                name = COALESCE(excluded.name, name),
                symbol = COALESCE(excluded.symbol, symbol)",
            params![coin_id, name, symbol, quantity, now],
        )?;
        let holding = tx.query_row(
            &format!("{SELECT_COLUMNS} WHERE coin_id = ?1"),
            params![coin_id],
            Holding::from_row,
        )?;
        tx.commit()?;

        log::info!("Holding {} now at {}", holding.coin_id, holding.quantity);
        Ok(holding)
    }

    pub fn update_quantity(&self, coin_id: &str, quantity: f64) -> Result<Holding, StoreError> {
        let coin_id = validate_coin_id(coin_id)?;
        let quantity = validate_quantity(quantity)?;

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE holdings SET quantity = ?1 WHERE coin_id = ?2",
            params![quantity, coin_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(coin_id));
        }
        let holding = conn.query_row(
            &format!("{SELECT_COLUMNS} WHERE coin_id = ?1"),
            params![coin_id],
            Holding::from_row,
        )?;
        Ok(holding)
    }

    pub fn get(&self, coin_id: &str) -> Result<Option<Holding>, StoreError> {
        let coin_id = normalize_coin_id(coin_id);
        let conn = self.conn()?;
        let holding = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE coin_id = ?1"),
                params![coin_id],
                Holding::from_row,
            )
            .optional()?;
        Ok(holding)
    }

    pub fn list(&self) -> Result<Vec<Holding>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))?;
        let rows = stmt.query_map([], Holding::from_row)?;
        let mut holdings = Vec::new();
        for row in rows {
            holdings.push(row?);
        }
        Ok(holdings)
    }

    pub fn delete(&self, coin_id: &str) -> Result<(), StoreError> {
        let coin_id = normalize_coin_id(coin_id);
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM holdings WHERE coin_id = ?1", params![coin_id])?;
        if removed == 0 {
            return Err(StoreError::NotFound(coin_id));
        }
        log::info!("Removed holding {coin_id}");
        Ok(())
    }
}
