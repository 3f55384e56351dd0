pub mod broadcast;
pub mod events;
pub mod services;
