//! RTunnel Relay
//!
//! Accepts public HTTP requests and relays them over the single attached
//! tunnel connection to a client running behind NAT.

pub mod auth;
pub mod config;
pub mod correlation;
pub mod registry;
pub mod server;
pub mod tunnel;

pub use config::{RelayArgs, RelayConfig};
pub use server::{app, AppState};
