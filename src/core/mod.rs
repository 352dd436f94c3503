pub mod components;
pub mod config;
pub mod connections;
pub mod errors;
pub mod events;
pub mod network;
pub mod ports;
pub mod scheduler;
pub mod values;

#[cfg(test)]
mod tests;
