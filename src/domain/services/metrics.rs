use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::position::Trade;

/// Session performance over closed trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Sum of realized P&L
    pub total_pnl: f64,
    /// Total P&L against total entry notional, in percent
    pub total_pnl_pct: f64,
    /// Fraction of trades with positive realized P&L (0.0 to 1.0)
    pub win_rate: f64,
    /// Largest peak-to-trough fall of the cumulative realized-P&L-% curve
    pub max_drawdown: f64,
    pub total_trades: usize,
    pub win_count: usize,
    pub lose_count: usize,
}

impl PerformanceSnapshot {
    /// Recomputes every figure from the full trade list.
    pub fn from_trades(trades: &[Trade], timestamp: DateTime<Utc>) -> Self {
        let total_trades = trades.len();
        let win_count = trades.iter().filter(|t| t.is_win()).count();
        let lose_count = total_trades - win_count;
        let total_pnl: f64 = trades.iter().map(|t| t.realized_pnl).sum();
        let notional: f64 = trades.iter().map(|t| t.entry_price * t.quantity).sum();

        let total_pnl_pct = if notional > 0.0 {
            total_pnl / notional * 100.0
        } else {
            0.0
        };
        let win_rate = if total_trades > 0 {
            win_count as f64 / total_trades as f64
        } else {
            0.0
        };

        let mut ordered: Vec<&Trade> = trades.iter().collect();
        ordered.sort_by_key(|t| t.exit_time);
        let returns: Vec<f64> = ordered.iter().map(|t| t.realized_pnl_pct).collect();

        Self {
            timestamp,
            total_pnl,
            total_pnl_pct,
            win_rate,
            max_drawdown: max_drawdown(&returns),
            total_trades,
            win_count,
            lose_count,
        }
    }
}

/// Max drawdown of the cumulative sum of `returns`, starting from a flat curve at zero.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut cumulative = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut worst = 0.0_f64;
    for r in returns {
        cumulative += r;
        peak = peak.max(cumulative);
        worst = worst.max(peak - cumulative);
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn trade(i: i64, entry: f64, exit: f64) -> Trade {
        let quantity = 0.1;
        let fee = entry * quantity * 0.001;
        let realized_pnl = quantity * (exit - entry) - fee;
        let entry_time = Utc.timestamp_opt(1_700_000_000 + i * 600, 0).unwrap();
        Trade {
            id: format!("t-{}", i),
            position_id: format!("p-{}", i),
            symbol: "BTC".to_string(),
            strategy: "ema_crossover".to_string(),
            entry_time,
            entry_price: entry,
            exit_time: entry_time + Duration::seconds(300),
            exit_price: exit,
            quantity,
            fee,
            slippage: 0.0,
            realized_pnl,
            realized_pnl_pct: realized_pnl / (entry * quantity) * 100.0,
            hold_duration_secs: 300,
        }
    }

    #[test]
    fn test_snapshot_of_no_trades_is_flat() {
        let snapshot = PerformanceSnapshot::from_trades(&[], Utc::now());
        assert_eq!(snapshot.total_trades, 0);
        assert_eq!(snapshot.total_pnl, 0.0);
        assert_eq!(snapshot.win_rate, 0.0);
        assert_eq!(snapshot.max_drawdown, 0.0);
    }

    #[test]
    fn test_snapshot_counts_and_totals() {
        let trades = vec![trade(0, 100.0, 110.0), trade(1, 100.0, 95.0), trade(2, 200.0, 220.0)];
        let snapshot = PerformanceSnapshot::from_trades(&trades, Utc::now());

        assert_eq!(snapshot.total_trades, 3);
        assert_eq!(snapshot.win_count, 2);
        assert_eq!(snapshot.lose_count, 1);
        assert!((snapshot.win_rate - 2.0 / 3.0).abs() < 1e-12);

        let expected_pnl: f64 = trades.iter().map(|t| t.realized_pnl).sum();
        assert!((snapshot.total_pnl - expected_pnl).abs() < 1e-12);
        assert!((snapshot.total_pnl_pct - expected_pnl / 40.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_drawdown_from_cumulative_curve() {
        // Curve: 5, 2, 6, 1, 3 -> worst fall is 6 to 1
        assert!((max_drawdown(&[5.0, -3.0, 4.0, -5.0, 2.0]) - 5.0).abs() < 1e-12);
        assert_eq!(max_drawdown(&[1.0, 2.0, 3.0]), 0.0);
        // Losing from the start counts against the zero baseline
        assert!((max_drawdown(&[-2.0, -1.0]) - 3.0).abs() < 1e-12);
    }
}
