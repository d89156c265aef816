use crate::connection::SessionConnection;
use crate::error::ClientError;
use crate::handshake::HandshakeClient;
use crate::session::Session;
use crate::transport::Transport;
use eiolink_protocol::Endpoint;
use tracing::instrument;

/// Runs the full connect pipeline against one endpoint: polling handshake, transport upgrade and
/// keep-alive.
///
/// The first failing step aborts the pipeline and its error is returned unchanged. Nothing is
/// retried.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    handshake: HandshakeClient,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Result<Self, ClientError> {
        Ok(Self {
            endpoint,
            handshake: HandshakeClient::new()?,
        })
    }

    pub fn with_handshake_client(mut self, handshake: HandshakeClient) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Performs the handshake only, e.g. to complete a partial [`Session`] before connecting.
    pub async fn handshake(&self) -> Result<Session, ClientError> {
        self.handshake.connect(&self.endpoint).await
    }

    /// Handshakes, upgrades onto `transport` and starts the keep-alive with the server's timing.
    #[instrument(level = "debug", skip_all, fields(base_url = %self.endpoint.base_url()), err)]
    pub async fn connect<T: Transport>(
        &self,
        transport: T,
    ) -> Result<SessionConnection<T>, ClientError> {
        let session = self.handshake().await?;
        self.connect_with_session(transport, &session).await
    }

    /// Upgrades onto `transport` with an already known session and starts the keep-alive.
    #[instrument(level = "debug", skip_all, fields(sid = ?session.sid()), err)]
    pub async fn connect_with_session<T: Transport>(
        &self,
        transport: T,
        session: &Session,
    ) -> Result<SessionConnection<T>, ClientError> {
        let connection = SessionConnection::new(transport, self.endpoint.clone());
        connection.connect_and_arm(session).await?;
        tracing::info!(sid = ?session.sid(), "Session connection established");
        Ok(connection)
    }
}
