//! RTunnel Shared Library
//!
//! Wire protocol, header handling and the error taxonomy used by both the
//! relay and the client.

pub mod error;
pub mod headers;
pub mod protocol;

pub use error::{RelayError, Result};
