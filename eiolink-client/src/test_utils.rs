use crate::connection::ConnectionEvent;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

#[async_trait]
pub trait AwaitConnectionEventExt {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<ConnectionEvent>
    where
        F: Fn(&ConnectionEvent) -> bool + Send;
}

#[async_trait]
impl AwaitConnectionEventExt for broadcast::Receiver<ConnectionEvent> {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<ConnectionEvent>
    where
        F: Fn(&ConnectionEvent) -> bool + Send,
    {
        loop {
            match tokio::time::timeout(timeout, self.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return Ok(event),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(anyhow::anyhow!("Timeout")),
                _ => continue,
            }
        }
    }
}
