use serde_json::{json, Value};

use crate::application::broadcast::messages::EventKind;
use crate::domain::entities::position::{Position, Trade};
use crate::domain::entities::signal::StrategySignal;
use crate::domain::services::metrics::PerformanceSnapshot;

/// Everything the pipeline publishes, carried on one outbound channel to the broadcast server.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationEvent {
    SignalCreated(StrategySignal),
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed { position: Position, trade: Trade },
    PerformanceSnapshot(PerformanceSnapshot),
}

fn position_payload(position: &Position) -> Value {
    json!({
        "position_id": position.id,
        "symbol": position.symbol,
        "strategy": position.strategy,
        "status": position.status,
        "entry_time": position.entry_time,
        "entry_price": position.entry_price,
        "quantity": position.quantity,
        "fee": position.fee,
        "current_price": position.current_price,
        "unrealized_pnl": position.unrealized_pnl(),
        "unrealized_pnl_pct": position.unrealized_pnl_pct(),
    })
}

impl SimulationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimulationEvent::SignalCreated(_) => EventKind::SignalCreated,
            SimulationEvent::PositionOpened(_) => EventKind::PositionOpened,
            SimulationEvent::PositionUpdated(_) => EventKind::PositionUpdated,
            SimulationEvent::PositionClosed { .. } => EventKind::PositionClosed,
            SimulationEvent::PerformanceSnapshot(_) => EventKind::PerformanceSnapshot,
        }
    }

    /// Routing symbol; `None` for process-wide events.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            SimulationEvent::SignalCreated(signal) => Some(&signal.symbol),
            SimulationEvent::PositionOpened(position) | SimulationEvent::PositionUpdated(position) => {
                Some(&position.symbol)
            }
            SimulationEvent::PositionClosed { position, .. } => Some(&position.symbol),
            SimulationEvent::PerformanceSnapshot(_) => None,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            SimulationEvent::SignalCreated(s) => json!({
                "signal_id": s.id,
                "symbol": s.symbol,
                "strategy": s.strategy,
                "timestamp": s.signal.timestamp,
                "side": s.signal.side,
                "price": s.signal.price,
                "confidence": s.signal.confidence,
            }),
            SimulationEvent::PositionOpened(position) | SimulationEvent::PositionUpdated(position) => {
                position_payload(position)
            }
            SimulationEvent::PositionClosed { position, trade } => {
                let mut payload = position_payload(position);
                if let Value::Object(map) = &mut payload {
                    map.insert("trade_id".into(), json!(trade.id));
                    map.insert("exit_time".into(), json!(trade.exit_time));
                    map.insert("exit_price".into(), json!(trade.exit_price));
                    map.insert("slippage".into(), json!(trade.slippage));
                    map.insert("realized_pnl".into(), json!(trade.realized_pnl));
                    map.insert("realized_pnl_pct".into(), json!(trade.realized_pnl_pct));
                    map.insert("hold_duration_secs".into(), json!(trade.hold_duration_secs));
                }
                payload
            }
            SimulationEvent::PerformanceSnapshot(snapshot) => json!(snapshot),
        }
    }
}
