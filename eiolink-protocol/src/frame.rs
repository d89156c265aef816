/// Liveness probe sent by the client.
pub const PING: &str = "2";
/// Liveness reply sent by the server.
pub const PONG: &str = "3";

/// Classification of a single text frame exchanged over the upgraded transport.
///
/// Only the two liveness literals carry meaning for the connection itself, every other frame is
/// handed to the application layer untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Client to server liveness probe (`"2"`).
    Ping,
    /// Server to client liveness reply (`"3"`).
    Pong,
    /// Opaque application payload, passed through verbatim.
    Payload(&'a str),
}

impl<'a> Frame<'a> {
    /// Classifies a raw frame. Matching is exact, `"3probe"` or `" 3"` are payloads.
    pub fn classify(raw: &'a str) -> Self {
        match raw {
            PING => Frame::Ping,
            PONG => Frame::Pong,
            other => Frame::Payload(other),
        }
    }

    pub fn as_str(&self) -> &'a str {
        match self {
            Frame::Ping => PING,
            Frame::Pong => PONG,
            Frame::Payload(payload) => payload,
        }
    }

    pub fn is_pong(&self) -> bool {
        matches!(self, Frame::Pong)
    }
}
