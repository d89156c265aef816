use crate::error::ClientError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Callback resolved by the next received pong.
pub type PongCallback = Box<dyn FnOnce() + Send>;

/// Something able to transmit a ping and queue the callback for its pong.
#[async_trait]
pub(crate) trait PingIssuer: Send + Sync {
    async fn issue_ping(&self, on_pong: PongCallback) -> Result<(), ClientError>;
}

#[derive(Debug)]
pub(crate) enum KeepAliveOutcome {
    /// The loop was stopped or the connection shut down.
    Cancelled,
    /// No pong arrived within the timeout after a ping.
    TimedOut(Duration),
    /// The ping could not be transmitted.
    PingFailed(ClientError),
    /// The pending pong was discarded without being resolved.
    Abandoned,
}

/// Runs the keep-alive loop until it is cancelled or fails.
///
/// The first ping is sent one `interval` after the start. Every tick waits for its pong or for the
/// `timeout` watchdog before the next tick may fire, so at most one ping is outstanding. A pong and
/// an expiring watchdog observed in the same poll count as a pong; once the watchdog has fired, a
/// late pong only resolves a dropped callback.
pub(crate) async fn run<P: PingIssuer + ?Sized>(
    issuer: &P,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> KeepAliveOutcome {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return KeepAliveOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        let (pong_tx, pong_rx) = oneshot::channel::<Instant>();
        let sent_at = Instant::now();
        tracing::trace!("Sending keep-alive ping");
        if let Err(err) = issuer
            .issue_ping(Box::new(move || {
                let _ = pong_tx.send(Instant::now());
            }))
            .await
        {
            tracing::warn!(?err, "Failed to send keep-alive ping");
            return KeepAliveOutcome::PingFailed(err);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return KeepAliveOutcome::Cancelled,
            pong = pong_rx => match pong {
                Ok(received_at) => {
                    tracing::trace!(rtt = ?received_at.duration_since(sent_at), "Received keep-alive pong");
                }
                Err(_) => {
                    tracing::debug!("Pending pong was discarded");
                    return KeepAliveOutcome::Abandoned;
                }
            },
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(?timeout, "Keep-alive pong timed out");
                return KeepAliveOutcome::TimedOut(timeout);
            }
        }
    }
}
