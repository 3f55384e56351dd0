use crate::domain::errors::ValidationError;

/// A non-negative, finite quote.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::InvalidPrice(format!("{} is not finite", value)));
        }
        if value < 0.0 {
            return Err(ValidationError::InvalidPrice(format!(
                "{} must be non-negative",
                value
            )));
        }
        Ok(Price(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl From<Price> for f64 {
    fn from(price: Price) -> Self {
        price.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_new_valid() {
        assert_eq!(Price::new(100.0).unwrap().value(), 100.0);
        assert_eq!(Price::new(0.0).unwrap().value(), 0.0);
    }

    #[test]
    fn test_price_rejects_negative_and_nan() {
        assert!(matches!(Price::new(-10.0), Err(ValidationError::InvalidPrice(_))));
        assert!(Price::new(f64::NAN).is_err());
        assert!(Price::new(f64::INFINITY).is_err());
    }
}
