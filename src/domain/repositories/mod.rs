pub mod simulation_store;
pub mod tick_feed;
