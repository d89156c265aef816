mod config;

use crate::config::AppConfig;
use anyhow::Context;
use eiolink_client::handshake::HandshakeClient;
use eiolink_client::protocol::Endpoint;
use eiolink_client::transport::tokio::TokioTransport;
use eiolink_client::{Client, Session, SessionConnection};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::parse()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let endpoint = Endpoint::new(&config.server.base_url)
        .context("Invalid server base URL")?
        .with_path(&config.server.endpoint_path);
    let handshake = HandshakeClient::with_timeout(config.server.handshake_timeout())?;
    let client = Client::new(endpoint)?.with_handshake_client(handshake);

    let session = if config.session.skips_handshake() {
        tracing::info!("Using preconfigured session, skipping handshake");
        config.session.apply(Session::default())
    } else {
        let session = client.handshake().await.context("Handshake failed")?;
        config.session.apply(session)
    };

    let connection = SessionConnection::new(TokioTransport::new(), client.endpoint().clone());
    connection
        .open(&session)
        .await
        .context("Failed to open connection")?;
    connection.register_receive_handler(|frame| tracing::info!(frame, "Received frame"))?;
    connection.register_send_handler(|frame| tracing::debug!(frame, "Sending frame"))?;
    connection
        .start_auto_ping(config.keep_alive.interval(), config.keep_alive.timeout())
        .context("Failed to start keep-alive")?;

    for message in &config.messages {
        connection
            .send(message.as_str())
            .await
            .context("Failed to send configured message")?;
    }

    tokio::select! {
        reason = connection.wait_closed() => match reason {
            Some(err) if err.is_fatal() => {
                tracing::error!(?err, "Connection failed");
                Err(err).context("Connection failed")
            }
            _ => {
                tracing::info!("Connection closed");
                Ok(())
            }
        },
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested, closing connection");
            connection.close().await;
            Ok(())
        }
    }
}
