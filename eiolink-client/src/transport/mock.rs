use crate::error::{RuntimeError, TransportFailureReason};
use crate::transport::{Transport, TransportReceiver, TransportSender};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use url::Url;

const MOCK_CHANNEL_SIZE: usize = 32;

/// In-memory transport. The [`MockHandle`] plays the server side.
pub struct MockTransport {
    halves: Mutex<Option<(MockSender, MockReceiver)>>,
    connect_urls: Arc<Mutex<Vec<Url>>>,
    fail_connect: bool,
    connect_delay: Option<Duration>,
}

pub struct MockHandle {
    /// Frames written by the client.
    pub outgoing_rx: mpsc::Receiver<tungstenite::Message>,
    /// Frames delivered to the client.
    pub incoming_tx: mpsc::Sender<tungstenite::Message>,
    connect_urls: Arc<Mutex<Vec<Url>>>,
}

pub struct MockSender {
    tx: Option<mpsc::Sender<tungstenite::Message>>,
}

pub struct MockReceiver {
    rx: mpsc::Receiver<tungstenite::Message>,
}

#[tracing::instrument(level = "debug")]
pub fn create() -> (MockTransport, MockHandle) {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(MOCK_CHANNEL_SIZE);
    let (incoming_tx, incoming_rx) = mpsc::channel(MOCK_CHANNEL_SIZE);
    let connect_urls = Arc::new(Mutex::new(Vec::new()));

    let transport = MockTransport {
        halves: Mutex::new(Some((
            MockSender {
                tx: Some(outgoing_tx),
            },
            MockReceiver { rx: incoming_rx },
        ))),
        connect_urls: connect_urls.clone(),
        fail_connect: false,
        connect_delay: None,
    };
    let handle = MockHandle {
        outgoing_rx,
        incoming_tx,
        connect_urls,
    };

    (transport, handle)
}

impl MockTransport {
    /// Makes every connect attempt fail after recording its URL.
    pub fn failing(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Delays every connect attempt, after its URL was recorded.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }
}

impl MockHandle {
    /// URLs of all connect attempts so far.
    pub fn connect_urls(&self) -> Vec<Url> {
        self.connect_urls.lock().clone()
    }

    /// Delivers a text frame to the client.
    pub async fn deliver(&self, text: &str) {
        self.incoming_tx
            .send(tungstenite::Message::text(text))
            .await
            .expect("mock client receiver dropped");
    }

    /// Next text frame written by the client, `None` once the client side is gone.
    pub async fn next_text(&mut self) -> Option<String> {
        while let Some(msg) = self.outgoing_rx.recv().await {
            if let tungstenite::Message::Text(text) = msg {
                return Some(text.as_str().to_owned());
            }
        }
        None
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    async fn connect(&self, url: &Url) -> Result<(Self::Sender, Self::Receiver), RuntimeError> {
        self.connect_urls.lock().push(url.clone());
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect {
            return Err(RuntimeError::Transport(TransportFailureReason::Connect(
                "mock connect failure".to_string(),
            )));
        }
        self.halves.lock().take().ok_or_else(|| {
            RuntimeError::Transport(TransportFailureReason::Connect(
                "mock transport already connected".to_string(),
            ))
        })
    }
}

#[async_trait]
impl TransportSender for MockSender {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), RuntimeError> {
        match self.tx {
            Some(ref tx) => tx.send(msg).await.map_err(|err| {
                tracing::warn!(?err, "Failed to send mock message");
                RuntimeError::Transport(TransportFailureReason::Send(err.to_string()))
            }),
            None => Err(RuntimeError::Transport(TransportFailureReason::Send(
                "sender closed".to_string(),
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), RuntimeError> {
        tracing::debug!("Closing MockSender");
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl TransportReceiver for MockReceiver {
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<String, RuntimeError> {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                tungstenite::Message::Text(text) => return Ok(text.as_str().to_owned()),
                tungstenite::Message::Close(_) => {
                    tracing::warn!("Received mock Close frame");
                    return Err(RuntimeError::Disconnected(None));
                }
                tungstenite::Message::Ping(data) => {
                    if send_tx.send(tungstenite::Message::Pong(data)).await.is_err() {
                        return Err(RuntimeError::Disconnected(None));
                    }
                }
                other => {
                    tracing::debug!(?other, "Skipping non-text mock frame");
                }
            }
        }
        tracing::warn!("Mock channel closed");
        Err(RuntimeError::Disconnected(None))
    }
}
