use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;
use crate::domain::value_objects::price::Price;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalSide {
    Buy,
    Sell,
}

impl SignalSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSide::Buy => "BUY",
            SignalSide::Sell => "SELL",
        }
    }
}

/// A strategy's decision on one candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub side: SignalSide,
    pub price: f64,
    pub confidence: f64,
}

impl Signal {
    pub fn new(
        timestamp: DateTime<Utc>,
        side: SignalSide,
        price: f64,
        confidence: f64,
    ) -> Result<Self, ValidationError> {
        let price = Price::new(price)?.value();
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(confidence));
        }
        Ok(Self {
            timestamp,
            side,
            price,
            confidence,
        })
    }

    pub fn buy(timestamp: DateTime<Utc>, price: f64, confidence: f64) -> Result<Self, ValidationError> {
        Self::new(timestamp, SignalSide::Buy, price, confidence)
    }

    pub fn sell(timestamp: DateTime<Utc>, price: f64, confidence: f64) -> Result<Self, ValidationError> {
        Self::new(timestamp, SignalSide::Sell, price, confidence)
    }
}

/// A signal tagged with the binding that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    /// Storage id, absent when the insert failed.
    pub id: Option<i64>,
    pub symbol: String,
    pub strategy: String,
    pub signal: Signal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_rejects_confidence_out_of_range() {
        let now = Utc::now();
        assert!(matches!(
            Signal::buy(now, 100.0, 1.5),
            Err(ValidationError::ConfidenceOutOfRange(_))
        ));
        assert!(Signal::sell(now, 100.0, -0.1).is_err());
        assert!(Signal::buy(now, 100.0, 1.0).is_ok());
    }

    #[test]
    fn test_signal_rejects_negative_price() {
        assert!(Signal::buy(Utc::now(), -1.0, 0.5).is_err());
    }

    #[test]
    fn test_side_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&SignalSide::Buy).unwrap(), "\"BUY\"");
    }
}
