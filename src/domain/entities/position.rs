use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

/// Ledger key: at most one open position per (symbol, strategy).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionKey {
    pub symbol: String,
    pub strategy: String,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            strategy: strategy.into(),
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.symbol, self.strategy)
    }
}

/// P&L of `quantity` units moved from `entry` to `price`, net of costs.
pub fn net_pnl(quantity: f64, entry: f64, price: f64, fee: f64, slippage: f64) -> f64 {
    quantity * (price - entry) - fee - slippage
}

/// `pnl` relative to the notional at entry, in percent. Zero notional yields zero.
pub fn pnl_pct(pnl: f64, entry: f64, quantity: f64) -> f64 {
    let notional = entry * quantity;
    if notional > 0.0 {
        pnl / notional * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub strategy: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub quantity: f64,
    pub fee: f64,
    /// Last mark price; equals entry price until the first mark.
    pub current_price: f64,
    pub status: PositionStatus,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub slippage: Option<f64>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.symbol.clone(), self.strategy.clone())
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Defined only while open.
    pub fn unrealized_pnl(&self) -> Option<f64> {
        self.is_open()
            .then(|| net_pnl(self.quantity, self.entry_price, self.current_price, self.fee, 0.0))
    }

    pub fn unrealized_pnl_pct(&self) -> Option<f64> {
        self.unrealized_pnl()
            .map(|pnl| pnl_pct(pnl, self.entry_price, self.quantity))
    }

    /// Fixed at close.
    pub fn realized_pnl(&self) -> Option<f64> {
        match (self.status, self.exit_price) {
            (PositionStatus::Closed, Some(exit)) => Some(net_pnl(
                self.quantity,
                self.entry_price,
                exit,
                self.fee,
                self.slippage.unwrap_or(0.0),
            )),
            _ => None,
        }
    }

    pub fn realized_pnl_pct(&self) -> Option<f64> {
        self.realized_pnl()
            .map(|pnl| pnl_pct(pnl, self.entry_price, self.quantity))
    }
}

/// Immutable record of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub position_id: String,
    pub symbol: String,
    pub strategy: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub slippage: f64,
    pub realized_pnl: f64,
    pub realized_pnl_pct: f64,
    pub hold_duration_secs: i64,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}
