pub mod orchestrator;
pub mod position_ledger;
pub mod strategy_runner;
