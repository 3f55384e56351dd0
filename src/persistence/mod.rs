//! Persistence Layer
//!
//! SQLite storage for sessions, signals, positions, trades, performance
//! snapshots and completed candles, via sqlx. An in-memory store with the same
//! interface backs tests and the `DATABASE_URL=memory` mode.
//!
//! # Database Schema
//!
//! - `sessions`: id, status, symbols/strategies (JSON), started/stopped timestamps
//! - `signals`: autoincrement id, session, symbol, strategy, side, price, confidence
//! - `positions`: uuid id, entry/exit fields, mark price, unrealized and realized P&L
//! - `trades`: uuid id, position id, entry/exit, fee, slippage, realized P&L, hold seconds
//! - `performance_snapshots`: one row per recomputed snapshot
//! - `candles`: keyed by (symbol, timeframe, timestamp)

pub mod memory;
pub mod models;
pub mod repository;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

pub use memory::InMemoryStore;
pub use repository::SqliteStore;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Opens (creating if missing) the SQLite database and applies the schema.
///
/// In-memory URLs get a single connection so every query sees the same database.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");
    Ok(pool)
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "sessions",
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL CHECK(status IN ('RUNNING', 'STOPPED', 'FAILED')),
            symbols TEXT NOT NULL,
            strategies TEXT NOT NULL,
            started_at DATETIME NOT NULL,
            stopped_at DATETIME
        )
        "#,
    ),
    (
        "signals",
        r#"
        CREATE TABLE IF NOT EXISTS signals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            strategy TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
            price REAL NOT NULL,
            confidence REAL NOT NULL
        )
        "#,
    ),
    (
        "positions",
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            strategy TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('OPEN', 'CLOSED')),
            entry_time DATETIME NOT NULL,
            entry_price REAL NOT NULL,
            quantity REAL NOT NULL,
            fee REAL NOT NULL,
            current_price REAL NOT NULL,
            unrealized_pnl REAL,
            unrealized_pnl_pct REAL,
            exit_time DATETIME,
            exit_price REAL,
            slippage REAL,
            realized_pnl REAL,
            realized_pnl_pct REAL
        )
        "#,
    ),
    (
        "trades",
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            position_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            strategy TEXT NOT NULL,
            entry_time DATETIME NOT NULL,
            entry_price REAL NOT NULL,
            exit_time DATETIME NOT NULL,
            exit_price REAL NOT NULL,
            quantity REAL NOT NULL,
            fee REAL NOT NULL,
            slippage REAL NOT NULL,
            realized_pnl REAL NOT NULL,
            realized_pnl_pct REAL NOT NULL,
            hold_duration_secs INTEGER NOT NULL
        )
        "#,
    ),
    (
        "performance_snapshots",
        r#"
        CREATE TABLE IF NOT EXISTS performance_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            total_pnl REAL NOT NULL,
            total_pnl_pct REAL NOT NULL,
            win_rate REAL NOT NULL,
            max_drawdown REAL NOT NULL,
            total_trades INTEGER NOT NULL,
            win_count INTEGER NOT NULL,
            lose_count INTEGER NOT NULL
        )
        "#,
    ),
    (
        "candles",
        r#"
        CREATE TABLE IF NOT EXISTS candles (
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume REAL NOT NULL,
            PRIMARY KEY (symbol, timeframe, timestamp)
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_signals_session ON signals(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
    "CREATE INDEX IF NOT EXISTS idx_trades_exit_time ON trades(exit_time)",
];

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    for (table, ddl) in SCHEMA {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {} table: {}", table, e))
        })?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    Ok(())
}
