pub mod endpoint;
pub mod frame;
pub mod handshake;

pub use endpoint::{Endpoint, EndpointError};
pub use frame::Frame;
pub use handshake::{HandshakeParseError, HandshakeResponse};

/// Engine.IO protocol revision spoken by the client, sent as the `EIO` query parameter.
pub const EIO_PROTOCOL_VERSION: u8 = 3;

/// Path segment the server mounts its Engine.IO endpoint under.
pub const DEFAULT_ENDPOINT_PATH: &str = "socket.io";
