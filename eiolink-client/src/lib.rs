pub mod client;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod handshake;
mod keepalive;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use client::Client;
pub use connection::{ConnectionEvent, SessionConnection, State};
pub use error::{ClientError, RuntimeError};
pub use session::Session;
pub use eiolink_protocol as protocol;

/// User-Agent string used for all HTTP requests.
static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
