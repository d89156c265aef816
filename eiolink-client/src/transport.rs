#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod tokio;

use crate::error::RuntimeError;
use ::tokio::sync::mpsc;
use async_trait::async_trait;
use tokio_tungstenite::tungstenite;
use url::Url;

/// Duplex text transport the connection is upgraded onto.
///
/// The implementation is expected to perform the byte-level upgrade itself; the connection only
/// supplies the URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Sender: TransportSender;
    type Receiver: TransportReceiver;

    async fn connect(&self, url: &Url) -> Result<(Self::Sender, Self::Receiver), RuntimeError>;
}

#[async_trait]
pub trait TransportSender: Send + Sync + 'static {
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), RuntimeError>;
    async fn close(&mut self) -> Result<(), RuntimeError>;
}

#[async_trait]
pub trait TransportReceiver: Send + Sync + 'static {
    /// Returns the next text frame. Control frames requiring an answer are replied to through
    /// `send_tx`, other non-text frames are skipped.
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<String, RuntimeError>;
}
