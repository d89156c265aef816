use crate::error::ConfigurationError;
use eiolink_protocol::HandshakeResponse;
use std::time::Duration;

/// Server-issued identity and timing contract of one logical connection.
///
/// Produced by [`HandshakeClient::connect`](crate::handshake::HandshakeClient::connect) or built
/// directly with [`Session::new`] when the values are already known. The handshake tolerates
/// missing fields, so a session may be incomplete until the caller fills the gaps with the `with_*`
/// builders. [`SessionConnection::open`](crate::connection::SessionConnection::open) rejects
/// incomplete sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    sid: Option<String>,
    ping_interval: Option<Duration>,
    ping_timeout: Option<Duration>,
    upgrades: Vec<String>,
}

/// Fully populated session values, as required for the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub sid: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Session {
    pub fn new(sid: impl Into<String>, ping_interval: Duration, ping_timeout: Duration) -> Self {
        Self {
            sid: Some(sid.into()),
            ping_interval: Some(ping_interval),
            ping_timeout: Some(ping_timeout),
            upgrades: Vec::new(),
        }
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
    }

    pub fn ping_timeout(&self) -> Option<Duration> {
        self.ping_timeout
    }

    pub fn upgrades(&self) -> &[String] {
        &self.upgrades
    }

    /// Supplies the session id if the server did not. Values that are already set are kept.
    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        if self.sid.as_deref().is_none_or(str::is_empty) {
            self.sid = Some(sid.into());
        }
        self
    }

    /// Supplies the ping interval if the server did not. Values that are already set are kept.
    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval.get_or_insert(ping_interval);
        self
    }

    /// Supplies the ping timeout if the server did not. Values that are already set are kept.
    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout.get_or_insert(ping_timeout);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<SessionParams, ConfigurationError> {
        let sid = match self.sid.as_deref() {
            Some(sid) if !sid.is_empty() => sid.to_string(),
            _ => return Err(ConfigurationError::IncompleteSession { missing: "sid" }),
        };
        let ping_interval = self.ping_interval.ok_or(ConfigurationError::IncompleteSession {
            missing: "ping_interval",
        })?;
        let ping_timeout = self.ping_timeout.ok_or(ConfigurationError::IncompleteSession {
            missing: "ping_timeout",
        })?;

        Ok(SessionParams {
            sid,
            ping_interval,
            ping_timeout,
        })
    }
}

impl From<HandshakeResponse> for Session {
    fn from(response: HandshakeResponse) -> Self {
        Self {
            sid: response.sid,
            ping_interval: response.ping_interval.map(Duration::from_millis),
            ping_timeout: response.ping_timeout.map(Duration::from_millis),
            upgrades: response.upgrades,
        }
    }
}
