use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Open packet returned by the server in response to the polling handshake request.
///
/// All fields are optional on purpose: a response lacking one of them is still a valid handshake,
/// it is up to the caller to supply the missing values before upgrading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Session identifier assigned by the server.
    pub sid: Option<String>,
    /// Interval between client pings, in milliseconds.
    pub ping_interval: Option<u64>,
    /// Time the client waits for a pong before considering the session dead, in milliseconds.
    pub ping_timeout: Option<u64>,
    /// Transports the session may be upgraded to.
    #[serde(default)]
    pub upgrades: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeParseError {
    #[error("response body does not contain a JSON object")]
    MissingObject,
    #[error("invalid handshake JSON: {0}")]
    InvalidJson(String),
}

impl HandshakeResponse {
    /// Parses a polling response body.
    ///
    /// The body is prefixed with payload framing (e.g. `97:0{...}`) and may be followed by further
    /// packets, so parsing starts at the first `{` and stops after the first complete object.
    pub fn parse(body: &str) -> Result<Self, HandshakeParseError> {
        let start = body.find('{').ok_or(HandshakeParseError::MissingObject)?;

        let mut stream = serde_json::Deserializer::from_str(&body[start..]).into_iter::<Self>();
        match stream.next() {
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => Err(HandshakeParseError::InvalidJson(err.to_string())),
            None => Err(HandshakeParseError::InvalidJson(
                "unexpected end of input".to_string(),
            )),
        }
    }
}
