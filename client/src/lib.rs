//! RTunnel client
//!
//! Keeps a tunnel open to a public relay and answers each relayed request
//! by calling the local target its path routes to.

pub mod config;
pub mod forward;
pub mod router;
pub mod session;
pub mod token;

pub use config::{ClientArgs, ClientConfig};
pub use session::Session;
