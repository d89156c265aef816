use crate::error::{ClientError, ConfigurationError, ProtocolError};
use crate::session::Session;
use eiolink_protocol::{Endpoint, HandshakeResponse};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::time::Duration;
use tracing::instrument;

/// Default timeout for the handshake request.
/// Can be overwritten using [`HandshakeClient::with_timeout`].
const HANDSHAKE_DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Length of the random `t` query parameter defeating intermediate caches.
const CACHE_BUSTER_LEN: usize = 7;

/// Performs the polling handshake that allocates a [`Session`].
#[derive(Debug, Clone)]
pub struct HandshakeClient {
    client: reqwest::Client,
}

impl HandshakeClient {
    pub fn new() -> Result<Self, ClientError> {
        Self::build(HANDSHAKE_DEFAULT_HTTP_TIMEOUT)
    }

    /// Creates a client whose handshake request gives up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ClientError> {
        Self::build(timeout)
    }

    fn build(timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .inspect_err(|err| tracing::error!(?err, "Failed to create HTTP client"))?;
        Ok(Self { client })
    }

    /// Issues a single handshake request against the endpoint.
    ///
    /// Fields missing from the server's answer are left unset in the returned [`Session`], they are
    /// only enforced once the session is used to open a connection. HTTP failures and non-2xx
    /// status codes are returned as [`ClientError::Http`], unparsable bodies as
    /// [`ProtocolError::MalformedHandshake`]. Nothing is retried.
    #[instrument(level = "debug", skip(self), fields(base_url = %endpoint.base_url()), err)]
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Session, ClientError> {
        let url = endpoint
            .handshake_url(&cache_buster())
            .map_err(|err| ConfigurationError::InvalidEndpoint(err.to_string()))?;

        tracing::trace!(%url, "Performing handshake request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .inspect_err(|err| tracing::warn!(?err, "Failed to perform handshake request"))?
            .error_for_status()
            .inspect_err(|err| tracing::warn!(?err, "Received non-2xx handshake status"))?;

        let body = response.text().await?;
        tracing::trace!(?body, "Parsing handshake response");

        let handshake = HandshakeResponse::parse(&body).map_err(|err| {
            tracing::warn!(?err, "Failed to parse handshake response");
            ProtocolError::MalformedHandshake(err.to_string())
        })?;

        let session = Session::from(handshake);
        if !session.is_complete() {
            tracing::debug!(?session, "Handshake response is missing session fields");
        }
        tracing::debug!(sid = ?session.sid(), "Handshake successful");
        Ok(session)
    }
}

fn cache_buster() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(CACHE_BUSTER_LEN)
        .map(char::from)
        .collect()
}
