pub mod candle_builder;
pub mod indicators;
pub mod metrics;
pub mod strategies;
