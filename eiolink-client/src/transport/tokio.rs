use crate::error::{RuntimeError, TransportFailureReason};
use crate::transport::{Transport, TransportReceiver, TransportSender};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct TokioTransport {
    connect_timeout: Duration,
}

impl Default for TokioTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TokioTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Transport for TokioTransport {
    type Sender = TokioSender;
    type Receiver = TokioReceiver;

    #[tracing::instrument(level = "info", skip(self), fields(url = %url), err)]
    async fn connect(&self, url: &Url) -> Result<(Self::Sender, Self::Receiver), RuntimeError> {
        tracing::info!("Upgrading to WebSocket transport");
        let (websocket_stream, response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    tracing::error!(timeout = ?self.connect_timeout, "Timed out connecting to server");
                    RuntimeError::Transport(TransportFailureReason::Connect(
                        "connect timed out".to_string(),
                    ))
                })?
                .map_err(|err| {
                    tracing::error!(?err, "Failed to connect to server");
                    RuntimeError::Transport(TransportFailureReason::Connect(err.to_string()))
                })?;
        tracing::debug!(?response, "WebSocket handshake response");

        let (websocket_tx, websocket_rx) = websocket_stream.split();

        tracing::info!("Successfully established WebSocket transport");
        Ok((
            TokioSender { websocket_tx },
            TokioReceiver { websocket_rx },
        ))
    }
}

pub struct TokioSender {
    websocket_tx: SplitSink<WebSocket, tungstenite::Message>,
}

pub struct TokioReceiver {
    websocket_rx: SplitStream<WebSocket>,
}

#[async_trait]
impl TransportSender for TokioSender {
    #[tracing::instrument(level = "trace", skip(self, msg), err)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), RuntimeError> {
        self.websocket_tx.send(msg).await.map_err(|err| {
            tracing::warn!(?err, "Failed to send message");
            RuntimeError::Transport(TransportFailureReason::Send(err.to_string()))
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), RuntimeError> {
        let _ = self
            .websocket_tx
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, "Failed to send Close frame");
            });

        self.websocket_tx.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close WebSocket connection");
            RuntimeError::Transport(TransportFailureReason::Close(err.to_string()))
        })
    }
}

#[async_trait]
impl TransportReceiver for TokioReceiver {
    #[tracing::instrument(level = "trace", skip(self, send_tx), err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<String, RuntimeError> {
        while let Some(msg) = self.websocket_rx.next().await {
            match msg {
                Ok(tungstenite::Message::Text(text)) => {
                    return Ok(text.as_str().to_owned());
                }
                Ok(tungstenite::Message::Close(reason)) => {
                    tracing::warn!(?reason, "Received Close WebSocket frame");
                    return Err(RuntimeError::Disconnected(
                        reason.map(|frame| frame.reason.as_str().to_owned()),
                    ));
                }
                Ok(tungstenite::Message::Ping(data)) => {
                    if let Err(err) = send_tx.send(tungstenite::Message::Pong(data)).await {
                        tracing::warn!(?err, "Failed to send WebSocket Pong");
                        return Err(RuntimeError::Disconnected(None));
                    }
                }
                Ok(other) => {
                    tracing::debug!(?other, "Skipping non-text WebSocket frame");
                }
                Err(err) => {
                    tracing::warn!(?err, "Failed to receive message");
                    return Err(RuntimeError::Transport(TransportFailureReason::Receive(
                        err.to_string(),
                    )));
                }
            }
        }
        tracing::warn!("WebSocket stream closed");
        Err(RuntimeError::Disconnected(None))
    }
}
