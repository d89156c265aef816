use crate::handlers::HandlerId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("handler {0} not found")]
    NotFound(HandlerId),
    #[error("HTTP error: {0}")]
    Http(#[from] Box<reqwest::Error>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("incomplete session, missing {missing}")]
    IncompleteSession { missing: &'static str },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("ping interval must be greater than zero")]
    InvalidPingInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("connection is not open")]
    NotReady,
    #[error("keep-alive is already running")]
    AlreadyRunning,
    #[error("keep-alive is not running")]
    NotRunning,
    #[error("connection has already been opened")]
    AlreadyOpened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LivenessFailure {
    #[error("no pong received within {0:?}")]
    PingTimeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailureReason {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("close failed: {0}")]
    Close(String),
}

/// Errors raised while a connection is running, also delivered through
/// [`ConnectionEvent::Error`](crate::connection::ConnectionEvent::Error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("liveness failure: {0}")]
    Liveness(#[from] LivenessFailure),
    #[error("transport error: {0}")]
    Transport(#[from] TransportFailureReason),
    #[error("disconnected: {0:?}")]
    Disconnected(Option<String>),
}

impl RuntimeError {
    /// Whether the error ends the connection. Only a failed close leaves it usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RuntimeError::Transport(TransportFailureReason::Close(_))
        )
    }
}
