use crate::error::{
    ClientError, ConfigurationError, LivenessFailure, RuntimeError, StateError,
};
use crate::handlers::{Direction, FrameHandler, HandlerTables};
use crate::keepalive::{self, KeepAliveOutcome, PingIssuer, PongCallback};
use crate::session::{Session, SessionParams};
use crate::transport::{Transport, TransportReceiver, TransportSender};
use async_trait::async_trait;
use eiolink_protocol::frame::PING;
use eiolink_protocol::{Endpoint, Frame};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

pub use crate::handlers::HandlerId;

const EVENT_CHANNEL_SIZE: usize = 100;
const SEND_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Initial state, no transport has been requested yet.
    Idle,
    /// The transport connect for a validated [`Session`] is in progress.
    Upgrading,
    /// The transport is established. Frames are dispatched, handlers can be registered and frames
    /// can be sent.
    Open,
    /// Final state, reached after a failed upgrade, a transport failure, a liveness failure or an
    /// explicit [`SessionConnection::close`]. A closed connection cannot be reopened, a new
    /// handshake and a new [`SessionConnection`] are required.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The upgrade succeeded.
    Opened,
    /// A runtime failure was detected. Fatal failures are followed by [`ConnectionEvent::Closed`].
    Error(RuntimeError),
    /// The connection reached [`State::Closed`].
    Closed,
}

struct KeepAlive {
    generation: u64,
    cancel: CancellationToken,
    interval: Duration,
    timeout: Duration,
}

#[derive(Default)]
struct Shared {
    session: Option<SessionParams>,
    handlers: HandlerTables,
    pending_pongs: VecDeque<PongCallback>,
    send_tx: Option<mpsc::Sender<tungstenite::Message>>,
    keep_alive: Option<KeepAlive>,
    keep_alive_generation: u64,
    runtime: Option<tokio::runtime::Handle>,
    close_reason: Option<RuntimeError>,
}

/// Upgraded duplex connection bound to one [`Session`].
///
/// Owns the transport, demultiplexes inbound frames into liveness traffic and application payloads
/// and runs the optional keep-alive loop. Dropping the connection stops all of its tasks.
pub struct SessionConnection<T: Transport> {
    inner: Arc<ConnectionInner<T>>,
}

impl<T: Transport> SessionConnection<T> {
    pub fn new(transport: T, endpoint: Endpoint) -> Self {
        Self {
            inner: Arc::new(ConnectionInner::new(transport, endpoint)),
        }
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Subscribes to a watch containing the current [`State`].
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to a broadcast channel emitting [`ConnectionEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Session the connection was opened with, `None` before a successful validation.
    pub fn session(&self) -> Option<SessionParams> {
        self.inner.shared.lock().session.clone()
    }

    /// Upgrades to the transport for the given session.
    ///
    /// Incomplete sessions are rejected with [`ConfigurationError::IncompleteSession`] before any
    /// network I/O, leaving the connection in [`State::Idle`].
    pub async fn open(&self, session: &Session) -> Result<(), ClientError> {
        self.inner.open(session).await
    }

    /// Opens the connection and immediately starts the keep-alive loop with the session's timing.
    pub async fn connect_and_arm(&self, session: &Session) -> Result<(), ClientError> {
        self.inner.open(session).await?;
        self.inner.start_auto_ping(None, None)
    }

    /// Registers an observer for every inbound application frame. Consumed pongs are not observed.
    pub fn register_receive_handler<F>(&self, handler: F) -> Result<HandlerId, ClientError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner
            .register_handler(Direction::Receive, Arc::new(handler))
    }

    /// Registers an observer for every frame passed to [`SessionConnection::send`], invoked before
    /// the frame is transmitted.
    pub fn register_send_handler<F>(&self, handler: F) -> Result<HandlerId, ClientError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.register_handler(Direction::Send, Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> Result<(), ClientError> {
        self.inner.remove_handler(id)
    }

    /// Transmits the payload verbatim.
    pub async fn send(&self, payload: impl Into<String>) -> Result<(), ClientError> {
        self.inner.send(payload.into()).await
    }

    /// Transmits a ping frame and queues `on_pong` for the next unclaimed pong.
    ///
    /// Pongs carry no correlation id and are matched strictly in FIFO order, so overlapping pings
    /// resolve in the order they were issued regardless of which pong answers which.
    pub async fn ping<F>(&self, on_pong: F) -> Result<(), ClientError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.ping(Box::new(on_pong)).await
    }

    /// Starts the keep-alive loop. Omitted values fall back to the session's ping interval and
    /// ping timeout.
    pub fn start_auto_ping(
        &self,
        interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        self.inner.start_auto_ping(interval, timeout)
    }

    /// Stops the keep-alive loop, including the watchdog of a ping still awaiting its pong.
    pub fn stop_auto_ping(&self) -> Result<(), ClientError> {
        self.inner.stop_auto_ping()
    }

    pub fn is_auto_pinging(&self) -> bool {
        self.inner.shared.lock().keep_alive.is_some()
    }

    /// Closes the connection, flushing frames that were already queued for transmission.
    pub async fn close(&self) {
        self.inner.terminate(None);
        self.inner.join_workers().await;
    }

    /// Waits until the connection is closed and returns the failure that closed it, if any.
    pub async fn wait_closed(&self) -> Option<RuntimeError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        if state_rx.wait_for(|state| *state == State::Closed).await.is_err() {
            tracing::warn!("State channel closed while waiting for connection close");
        }
        self.inner.shared.lock().close_reason.clone()
    }
}

impl<T: Transport> fmt::Debug for SessionConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConnection")
            .field("state", &self.state())
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Drop for SessionConnection<T> {
    fn drop(&mut self) {
        self.inner.disconnect_token.cancel();
        self.inner.worker_tasks.lock().abort_all();
    }
}

struct ConnectionInner<T: Transport> {
    transport: T,
    endpoint: Endpoint,

    state_tx: watch::Sender<State>,
    events_tx: broadcast::Sender<ConnectionEvent>,

    shared: Mutex<Shared>,

    disconnect_token: CancellationToken,
    worker_tasks: Mutex<JoinSet<()>>,
}

impl<T: Transport> ConnectionInner<T> {
    fn new(transport: T, endpoint: Endpoint) -> Self {
        Self {
            transport,
            endpoint,
            state_tx: watch::Sender::new(State::Idle),
            events_tx: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            shared: Mutex::new(Shared::default()),
            disconnect_token: CancellationToken::new(),
            worker_tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        match self.state() {
            State::Open => Ok(()),
            state => {
                tracing::warn!(?state, "Operation requires an open connection");
                Err(StateError::NotReady)
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events_tx.receiver_count() > 0
            && let Err(err) = self.events_tx.send(event)
        {
            tracing::warn!(?err, "Failed to broadcast connection event");
        }
    }

    #[instrument(level = "debug", skip_all, fields(sid = ?session.sid()), err)]
    async fn open(self: &Arc<Self>, session: &Session) -> Result<(), ClientError> {
        if self.state() != State::Idle {
            return Err(StateError::AlreadyOpened.into());
        }

        let params = session.validate().inspect_err(|err| {
            tracing::warn!(?err, "Refusing to upgrade with incomplete session");
        })?;
        let url = self
            .endpoint
            .upgrade_url(&params.sid)
            .map_err(|err| ConfigurationError::InvalidEndpoint(err.to_string()))?;

        let claimed = self.state_tx.send_if_modified(|state| {
            if *state == State::Idle {
                *state = State::Upgrading;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(StateError::AlreadyOpened.into());
        }

        tracing::debug!(%url, "Upgrading connection");
        let (mut sender, receiver) = match self.transport.connect(&url).await {
            Ok(halves) => halves,
            Err(err) => {
                tracing::warn!(?err, "Failed to upgrade connection");
                self.terminate(Some(err.clone()));
                return Err(err.into());
            }
        };

        let (send_tx, send_rx) = mpsc::channel::<tungstenite::Message>(SEND_CHANNEL_SIZE);
        let opened = {
            let mut shared = self.shared.lock();
            // terminate checks and sets Closed under the same lock
            let opened = self.state_tx.send_if_modified(|state| {
                if *state == State::Upgrading {
                    *state = State::Open;
                    true
                } else {
                    false
                }
            });
            if opened {
                shared.session = Some(params);
                shared.send_tx = Some(send_tx.clone());
                shared.runtime = Some(tokio::runtime::Handle::current());
            }
            opened
        };
        if !opened {
            tracing::debug!("Connection closed while upgrading, discarding transport");
            if let Err(err) = sender.close().await {
                tracing::warn!(?err, "Failed to close discarded transport");
            }
            return Err(StateError::NotReady.into());
        }
        self.emit(ConnectionEvent::Opened);

        {
            let mut tasks = self.worker_tasks.lock();
            tasks.spawn(self.clone().reader_task(receiver, send_tx));
            tasks.spawn(self.clone().writer_task(sender, send_rx));
        }

        tracing::info!("Connection open");
        Ok(())
    }

    fn register_handler(
        &self,
        direction: Direction,
        handler: FrameHandler,
    ) -> Result<HandlerId, ClientError> {
        let mut shared = self.shared.lock();
        self.ensure_open()?;
        let id = shared.handlers.register(direction, handler);
        tracing::trace!(
            %id,
            ?direction,
            count = shared.handlers.len(direction),
            "Registered handler"
        );
        Ok(id)
    }

    fn remove_handler(&self, id: HandlerId) -> Result<(), ClientError> {
        let mut shared = self.shared.lock();
        self.ensure_open()?;
        match shared.handlers.remove(id) {
            Some(direction) => {
                tracing::trace!(%id, ?direction, "Removed handler");
                Ok(())
            }
            None => {
                tracing::debug!(%id, "Handler to remove not found");
                Err(ClientError::NotFound(id))
            }
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn send(&self, payload: String) -> Result<(), ClientError> {
        let (send_tx, handlers) = {
            let shared = self.shared.lock();
            self.ensure_open()?;
            (
                shared.send_tx.clone().ok_or(StateError::NotReady)?,
                shared.handlers.snapshot(Direction::Send),
            )
        };

        for handler in handlers {
            handler(&payload);
        }

        send_tx
            .send(tungstenite::Message::text(payload))
            .await
            .map_err(|_| {
                tracing::warn!("Send channel closed");
                RuntimeError::Disconnected(None).into()
            })
    }

    async fn ping(&self, on_pong: PongCallback) -> Result<(), ClientError> {
        let send_tx = {
            let mut shared = self.shared.lock();
            self.ensure_open()?;
            let send_tx = shared.send_tx.clone().ok_or(StateError::NotReady)?;
            // queued before transmission so an instant pong finds its callback
            shared.pending_pongs.push_back(on_pong);
            send_tx
        };

        tracing::trace!("Sending ping");
        send_tx
            .send(tungstenite::Message::text(PING))
            .await
            .map_err(|_| {
                tracing::warn!("Send channel closed");
                RuntimeError::Disconnected(None).into()
            })
    }

    /// Single entry point for inbound frames.
    fn dispatch(&self, frame: &str) {
        let on_pong = if Frame::classify(frame).is_pong() {
            self.shared.lock().pending_pongs.pop_front()
        } else {
            None
        };
        if let Some(on_pong) = on_pong {
            tracing::trace!("Received pong");
            on_pong();
            return;
        }

        let handlers = self.shared.lock().handlers.snapshot(Direction::Receive);
        tracing::trace!(handlers = handlers.len(), "Dispatching frame");
        for handler in handlers {
            handler(frame);
        }
    }

    fn start_auto_ping(
        self: &Arc<Self>,
        interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        let (generation, interval, timeout, cancel, runtime) = {
            let mut shared = self.shared.lock();
            self.ensure_open()?;
            if let Some(keep_alive) = &shared.keep_alive {
                tracing::warn!(
                    interval = ?keep_alive.interval,
                    timeout = ?keep_alive.timeout,
                    "Keep-alive is already running"
                );
                return Err(StateError::AlreadyRunning.into());
            }

            let session = shared.session.as_ref().ok_or(StateError::NotReady)?;
            let interval = interval.unwrap_or(session.ping_interval);
            let timeout = timeout.unwrap_or(session.ping_timeout);
            if interval.is_zero() {
                return Err(ConfigurationError::InvalidPingInterval.into());
            }
            let runtime = shared.runtime.clone().ok_or(StateError::NotReady)?;

            shared.keep_alive_generation += 1;
            let generation = shared.keep_alive_generation;
            let cancel = self.disconnect_token.child_token();
            shared.keep_alive = Some(KeepAlive {
                generation,
                cancel: cancel.clone(),
                interval,
                timeout,
            });
            (generation, interval, timeout, cancel, runtime)
        };

        tracing::debug!(?interval, ?timeout, "Starting keep-alive");
        runtime.spawn(
            self.clone()
                .keep_alive_task(generation, interval, timeout, cancel)
                .instrument(tracing::Span::current()),
        );
        Ok(())
    }

    fn stop_auto_ping(&self) -> Result<(), ClientError> {
        let keep_alive = {
            let mut shared = self.shared.lock();
            self.ensure_open()?;
            shared.keep_alive.take().ok_or(StateError::NotRunning)?
        };

        tracing::debug!("Stopping keep-alive");
        keep_alive.cancel.cancel();
        Ok(())
    }

    /// Moves the connection to [`State::Closed`] exactly once, recording the failure that caused it.
    fn terminate(&self, reason: Option<RuntimeError>) {
        let (keep_alive, pending_pongs) = {
            let mut shared = self.shared.lock();
            if self.state() == State::Closed {
                return;
            }
            shared.close_reason = reason.clone();
            shared.send_tx = None;
            let pending_pongs = std::mem::take(&mut shared.pending_pongs);
            let keep_alive = shared.keep_alive.take();
            self.state_tx.send_replace(State::Closed);
            (keep_alive, pending_pongs)
        };

        if let Some(keep_alive) = keep_alive {
            keep_alive.cancel.cancel();
        }
        self.disconnect_token.cancel();
        drop(pending_pongs);

        match reason {
            Some(err) => {
                tracing::warn!(?err, "Connection closed");
                self.emit(ConnectionEvent::Error(err));
            }
            None => tracing::info!("Connection closed"),
        }
        self.emit(ConnectionEvent::Closed);
    }

    fn fail(&self, err: RuntimeError) {
        if err.is_fatal() {
            self.terminate(Some(err));
        } else {
            tracing::debug!(?err, "Non-fatal runtime error");
            self.emit(ConnectionEvent::Error(err));
        }
    }

    async fn join_workers(&self) {
        let mut worker_tasks = {
            let mut worker_tasks = self.worker_tasks.lock();
            std::mem::replace(&mut *worker_tasks, JoinSet::new())
        };

        while let Some(res) = worker_tasks.join_next().await {
            if let Err(err) = res
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join worker task");
            }
        }
    }

    async fn keep_alive_task(
        self: Arc<Self>,
        generation: u64,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        match keepalive::run(self.as_ref(), interval, timeout, cancel).await {
            KeepAliveOutcome::Cancelled => tracing::trace!("Keep-alive stopped"),
            KeepAliveOutcome::TimedOut(timeout) => {
                tracing::error!(?timeout, "Server stopped answering pings, connection presumed dead");
                self.terminate(Some(LivenessFailure::PingTimeout(timeout).into()));
            }
            KeepAliveOutcome::PingFailed(err) => {
                tracing::warn!(?err, "Keep-alive ended after failed ping");
                self.clear_keep_alive(generation);
            }
            KeepAliveOutcome::Abandoned => {
                tracing::debug!("Keep-alive ended with connection");
                self.clear_keep_alive(generation);
            }
        }
    }

    /// Forgets the keep-alive registration unless a newer loop has replaced it.
    fn clear_keep_alive(&self, generation: u64) {
        let mut shared = self.shared.lock();
        if shared
            .keep_alive
            .as_ref()
            .is_some_and(|keep_alive| keep_alive.generation == generation)
        {
            shared.keep_alive = None;
        }
    }

    fn reader_task<R: TransportReceiver>(
        self: Arc<Self>,
        mut receiver: R,
        send_tx: mpsc::Sender<tungstenite::Message>,
    ) -> impl Future<Output = ()> + Send + 'static {
        async move {
            tracing::debug!("Starting transport reader task");
            let _guard = TaskDropLogger::new("reader");

            loop {
                tokio::select! {
                    biased;

                    _ = self.disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, exiting transport reader task");
                        break;
                    }

                    frame = receiver.recv(&send_tx) => {
                        match frame {
                            Ok(frame) => self.dispatch(&frame),
                            Err(err) => {
                                self.fail(err);
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }

    fn writer_task<S: TransportSender>(
        self: Arc<Self>,
        mut sender: S,
        mut send_rx: mpsc::Receiver<tungstenite::Message>,
    ) -> impl Future<Output = ()> + Send + 'static {
        async move {
            tracing::debug!("Starting transport writer task");
            let _guard = TaskDropLogger::new("writer");

            loop {
                tokio::select! {
                    biased;

                    _ = self.disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, flushing and closing sender");
                        while let Ok(msg) = send_rx.try_recv() {
                            if let Err(err) = sender.send(msg).await {
                                tracing::debug!(?err, "Failed to flush queued frame");
                                break;
                            }
                        }
                        if let Err(err) = sender.close().await {
                            tracing::warn!(?err, "Failed to close transport");
                        }
                        break;
                    }

                    msg = send_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(err) = sender.send(msg).await {
                                    self.fail(err);
                                    break;
                                }
                            }
                            None => {
                                self.fail(RuntimeError::Disconnected(None));
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }
}

#[async_trait]
impl<T: Transport> PingIssuer for ConnectionInner<T> {
    async fn issue_ping(&self, on_pong: PongCallback) -> Result<(), ClientError> {
        self.ping(on_pong).await
    }
}

struct TaskDropLogger {
    name: &'static str,
}

impl TaskDropLogger {
    fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Drop for TaskDropLogger {
    fn drop(&mut self) {
        tracing::trace!(task_name = ?self.name, "Task dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportFailureReason;
    use crate::test_utils::AwaitConnectionEventExt;
    use crate::transport::mock::{self, MockHandle, MockTransport};
    use pretty_assertions::{assert_eq, assert_matches};
    use test_log::test;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    const RECV_TIMEOUT: Duration = Duration::from_millis(100);

    fn endpoint() -> Endpoint {
        Endpoint::new("http://localhost:3000").unwrap()
    }

    fn session() -> Session {
        Session::new(
            "abc123",
            Duration::from_millis(1000),
            Duration::from_millis(500),
        )
    }

    async fn open_connection() -> (SessionConnection<MockTransport>, MockHandle) {
        let (transport, handle) = mock::create();
        let connection = SessionConnection::new(transport, endpoint());
        connection.open(&session()).await.unwrap();
        (connection, handle)
    }

    fn forward_frames(
        connection: &SessionConnection<MockTransport>,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        connection
            .register_receive_handler(move |frame| {
                let _ = tx.send(frame.to_string());
            })
            .unwrap();
        rx
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("frame channel closed")
    }

    #[test(tokio::test)]
    async fn open_rejects_incomplete_session() {
        let (transport, handle) = mock::create();
        let connection = SessionConnection::new(transport, endpoint());
        let session = Session::default()
            .with_sid("abc123")
            .with_ping_interval(Duration::from_millis(1000));

        let res = connection.open(&session).await;

        assert_matches!(
            res,
            Err(ClientError::Configuration(
                ConfigurationError::IncompleteSession {
                    missing: "ping_timeout"
                }
            ))
        );
        assert!(handle.connect_urls().is_empty());
        assert_eq!(connection.state(), State::Idle);
        assert_eq!(connection.session(), None);
    }

    #[test(tokio::test)]
    async fn open_upgrades_with_session_id() {
        let (transport, handle) = mock::create();
        let connection = SessionConnection::new(transport, endpoint());
        let mut events = connection.subscribe();

        connection.open(&session()).await.unwrap();

        assert_eq!(connection.state(), State::Open);
        assert_eq!(
            handle
                .connect_urls()
                .iter()
                .map(|url| url.as_str().to_string())
                .collect::<Vec<_>>(),
            vec!["ws://localhost:3000/socket.io/?EIO=3&transport=websocket&sid=abc123"]
        );
        assert_eq!(
            connection.session(),
            Some(SessionParams {
                sid: "abc123".to_string(),
                ping_interval: Duration::from_millis(1000),
                ping_timeout: Duration::from_millis(500),
            })
        );
        let event = events.recv_with_timeout(RECV_TIMEOUT, |_| true).await.unwrap();
        assert_eq!(event, ConnectionEvent::Opened);
        assert!(!connection.is_auto_pinging());
    }

    #[test(tokio::test)]
    async fn open_twice_fails() {
        let (connection, handle) = open_connection().await;

        let res = connection.open(&session()).await;

        assert_matches!(res, Err(ClientError::State(StateError::AlreadyOpened)));
        assert_eq!(handle.connect_urls().len(), 1);
        assert_eq!(connection.state(), State::Open);
    }

    #[test(tokio::test)]
    async fn failed_upgrade_closes_connection() {
        let (transport, handle) = mock::create();
        let connection = SessionConnection::new(transport.failing(), endpoint());

        let res = connection.open(&session()).await;

        assert_matches!(
            res,
            Err(ClientError::Runtime(RuntimeError::Transport(
                TransportFailureReason::Connect(_)
            )))
        );
        assert_eq!(handle.connect_urls().len(), 1);
        assert_eq!(connection.state(), State::Closed);
        assert_matches!(
            connection.open(&session()).await,
            Err(ClientError::State(StateError::AlreadyOpened))
        );
        assert_matches!(
            connection.wait_closed().await,
            Some(RuntimeError::Transport(TransportFailureReason::Connect(_)))
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn close_during_upgrade_stays_closed() {
        let (transport, mut handle) = mock::create();
        let connection = SessionConnection::new(
            transport.with_connect_delay(Duration::from_millis(50)),
            endpoint(),
        );
        let mut state_rx = connection.subscribe_state();

        let session = session();
        let (open_res, ()) = tokio::join!(connection.open(&session), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(connection.state(), State::Upgrading);
            connection.close().await;
        });

        assert_matches!(open_res, Err(ClientError::State(StateError::NotReady)));
        assert_eq!(connection.state(), State::Closed);
        assert_eq!(*state_rx.borrow_and_update(), State::Closed);
        assert_eq!(connection.session(), None);
        assert_matches!(
            connection.send("4hello").await,
            Err(ClientError::State(StateError::NotReady))
        );
        assert_eq!(
            tokio::time::timeout(RECV_TIMEOUT, connection.wait_closed())
                .await
                .unwrap(),
            None
        );
        // the transport obtained after the close was shut down again
        assert_eq!(handle.next_text().await, None);
    }

    #[test(tokio::test)]
    async fn debug_reports_state_and_endpoint() {
        let (connection, _handle) = open_connection().await;

        let debug = format!("{connection:?}");

        assert!(debug.contains("state: Open"), "{debug}");
        assert!(debug.contains("localhost"), "{debug}");
    }

    #[test(tokio::test)]
    async fn operations_require_open_connection() {
        let (transport, _handle) = mock::create();
        let connection = SessionConnection::new(transport, endpoint());

        assert_matches!(
            connection.send("4hello").await,
            Err(ClientError::State(StateError::NotReady))
        );
        assert_matches!(
            connection.ping(|| {}).await,
            Err(ClientError::State(StateError::NotReady))
        );
        assert_matches!(
            connection.register_receive_handler(|_| {}),
            Err(ClientError::State(StateError::NotReady))
        );
        assert_matches!(
            connection.start_auto_ping(None, None),
            Err(ClientError::State(StateError::NotReady))
        );
        assert_matches!(
            connection.stop_auto_ping(),
            Err(ClientError::State(StateError::NotReady))
        );
    }

    #[test(tokio::test)]
    async fn pong_resolves_pending_ping_without_dispatch() {
        let (connection, mut handle) = open_connection().await;
        let mut frames = forward_frames(&connection);
        let (pong_tx, pong_rx) = oneshot::channel();

        connection
            .ping(move || {
                let _ = pong_tx.send(());
            })
            .await
            .unwrap();
        assert_eq!(handle.next_text().await.as_deref(), Some("2"));

        handle.deliver("3").await;
        tokio::time::timeout(RECV_TIMEOUT, pong_rx)
            .await
            .unwrap()
            .unwrap();

        handle.deliver("4hello").await;
        assert_eq!(next_frame(&mut frames).await, "4hello");
    }

    #[test(tokio::test)]
    async fn pongs_resolve_in_ping_order() {
        let (connection, handle) = open_connection().await;
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        let first = order.clone();
        connection
            .ping(move || first.lock().push(1))
            .await
            .unwrap();
        let second = order.clone();
        connection
            .ping(move || {
                second.lock().push(2);
                let _ = done_tx.send(());
            })
            .await
            .unwrap();

        handle.deliver("3").await;
        handle.deliver("3").await;
        tokio::time::timeout(RECV_TIMEOUT, done_rx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test(tokio::test)]
    async fn unsolicited_pong_is_dispatched() {
        let (connection, handle) = open_connection().await;
        let mut frames = forward_frames(&connection);

        handle.deliver("3").await;

        assert_eq!(next_frame(&mut frames).await, "3");
    }

    #[test(tokio::test)]
    async fn payloads_reach_handlers_in_registration_order() {
        let (connection, handle) = open_connection().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let log = log.clone();
            connection
                .register_receive_handler(move |frame| log.lock().push(format!("{name}:{frame}")))
                .unwrap();
        }
        let mut frames = forward_frames(&connection);

        handle.deliver("42[\"chat\",\"hi\"]").await;
        handle.deliver("3probe").await;
        assert_eq!(next_frame(&mut frames).await, "42[\"chat\",\"hi\"]");
        assert_eq!(next_frame(&mut frames).await, "3probe");

        assert_eq!(
            *log.lock(),
            vec![
                "first:42[\"chat\",\"hi\"]",
                "second:42[\"chat\",\"hi\"]",
                "first:3probe",
                "second:3probe",
            ]
        );
    }

    #[test(tokio::test)]
    async fn removed_handler_is_not_invoked() {
        let (connection, handle) = open_connection().await;
        let removed = Arc::new(Mutex::new(Vec::<String>::new()));
        let id = {
            let removed = removed.clone();
            connection
                .register_receive_handler(move |frame| removed.lock().push(frame.to_string()))
                .unwrap()
        };
        let mut frames = forward_frames(&connection);

        connection.remove_handler(id).unwrap();
        assert_matches!(
            connection.remove_handler(id),
            Err(ClientError::NotFound(missing)) if missing == id
        );

        handle.deliver("4hello").await;
        assert_eq!(next_frame(&mut frames).await, "4hello");
        assert!(removed.lock().is_empty());
    }

    #[test(tokio::test)]
    async fn handler_registered_during_dispatch_sees_later_frames() {
        let (transport, handle) = mock::create();
        let connection = Arc::new(SessionConnection::new(transport, endpoint()));
        connection.open(&session()).await.unwrap();
        let (late_tx, mut late_rx) = mpsc::unbounded_channel();

        let weak = Arc::downgrade(&connection);
        connection
            .register_receive_handler(move |frame| {
                if frame == "4register"
                    && let Some(connection) = weak.upgrade()
                {
                    let late_tx = late_tx.clone();
                    connection
                        .register_receive_handler(move |frame| {
                            let _ = late_tx.send(frame.to_string());
                        })
                        .unwrap();
                }
            })
            .unwrap();

        handle.deliver("4register").await;
        handle.deliver("4after").await;

        assert_eq!(next_frame(&mut late_rx).await, "4after");
        assert!(late_rx.try_recv().is_err());
    }

    #[test(tokio::test)]
    async fn send_handlers_observe_sends_but_not_pings() {
        let (connection, mut handle) = open_connection().await;
        let sent = Arc::new(Mutex::new(Vec::new()));
        {
            let sent = sent.clone();
            connection
                .register_send_handler(move |frame| sent.lock().push(frame.to_string()))
                .unwrap();
        }

        connection.send("4hello").await.unwrap();
        connection.ping(|| {}).await.unwrap();

        assert_eq!(handle.next_text().await.as_deref(), Some("4hello"));
        assert_eq!(handle.next_text().await.as_deref(), Some("2"));
        assert_eq!(*sent.lock(), vec!["4hello"]);
    }

    #[test(tokio::test)]
    async fn auto_ping_lifecycle() {
        let (connection, _handle) = open_connection().await;

        connection.start_auto_ping(None, None).unwrap();
        assert!(connection.is_auto_pinging());
        assert_matches!(
            connection.start_auto_ping(None, None),
            Err(ClientError::State(StateError::AlreadyRunning))
        );

        connection.stop_auto_ping().unwrap();
        assert!(!connection.is_auto_pinging());
        assert_matches!(
            connection.stop_auto_ping(),
            Err(ClientError::State(StateError::NotRunning))
        );

        connection
            .start_auto_ping(Some(Duration::from_millis(200)), None)
            .unwrap();
        assert!(connection.is_auto_pinging());
    }

    #[test(tokio::test)]
    async fn auto_ping_rejects_zero_interval() {
        let (connection, _handle) = open_connection().await;

        assert_matches!(
            connection.start_auto_ping(Some(Duration::ZERO), None),
            Err(ClientError::Configuration(
                ConfigurationError::InvalidPingInterval
            ))
        );
        assert!(!connection.is_auto_pinging());
    }

    #[test(tokio::test(start_paused = true))]
    async fn missing_pong_closes_connection() {
        let (transport, mut handle) = mock::create();
        let connection = SessionConnection::new(transport, endpoint());
        let mut events = connection.subscribe();
        let start = Instant::now();

        connection.connect_and_arm(&session()).await.unwrap();
        let reason = connection.wait_closed().await;

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(1510),
            "closed after {elapsed:?}"
        );
        assert_eq!(
            reason,
            Some(RuntimeError::Liveness(LivenessFailure::PingTimeout(
                Duration::from_millis(500)
            )))
        );
        assert_eq!(connection.state(), State::Closed);
        assert!(!connection.is_auto_pinging());
        assert_eq!(handle.next_text().await.as_deref(), Some("2"));

        let event = events
            .recv_with_timeout(RECV_TIMEOUT, |event| matches!(event, ConnectionEvent::Error(_)))
            .await
            .unwrap();
        assert_matches!(event, ConnectionEvent::Error(RuntimeError::Liveness(_)));
        let event = events.recv_with_timeout(RECV_TIMEOUT, |_| true).await.unwrap();
        assert_eq!(event, ConnectionEvent::Closed);
        assert_matches!(
            connection.send("4hello").await,
            Err(ClientError::State(StateError::NotReady))
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn answered_pings_keep_connection_open() {
        let (connection, mut handle) = open_connection().await;
        let pings = Arc::new(Mutex::new(0usize));

        let server = tokio::spawn({
            let pings = pings.clone();
            async move {
                while let Some(frame) = handle.next_text().await {
                    if frame == PING {
                        *pings.lock() += 1;
                        handle.deliver("3").await;
                    }
                }
            }
        });

        connection.start_auto_ping(None, None).unwrap();
        tokio::time::sleep(Duration::from_millis(5200)).await;

        assert_eq!(connection.state(), State::Open);
        assert_eq!(*pings.lock(), 5);

        connection.close().await;
        assert_eq!(connection.wait_closed().await, None);
        server.await.unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn stop_auto_ping_disarms_pending_watchdog() {
        let (connection, mut handle) = open_connection().await;

        connection.start_auto_ping(None, None).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(handle.next_text().await.as_deref(), Some("2"));

        connection.stop_auto_ping().unwrap();
        tokio::time::sleep(Duration::from_millis(2000)).await;

        assert_eq!(connection.state(), State::Open);
    }

    #[test(tokio::test)]
    async fn transport_close_closes_connection() {
        let (connection, handle) = open_connection().await;
        let mut events = connection.subscribe();

        handle
            .incoming_tx
            .send(tungstenite::Message::Close(None))
            .await
            .unwrap();

        assert_eq!(
            connection.wait_closed().await,
            Some(RuntimeError::Disconnected(None))
        );
        assert_eq!(connection.state(), State::Closed);
        let event = events
            .recv_with_timeout(RECV_TIMEOUT, |event| *event == ConnectionEvent::Closed)
            .await;
        assert!(event.is_ok());
    }

    #[test(tokio::test)]
    async fn close_flushes_queued_frames() {
        let (connection, mut handle) = open_connection().await;

        connection.send("4first").await.unwrap();
        connection.send("4second").await.unwrap();
        connection.close().await;

        assert_eq!(handle.next_text().await.as_deref(), Some("4first"));
        assert_eq!(handle.next_text().await.as_deref(), Some("4second"));
        assert_eq!(handle.next_text().await, None);
        assert_eq!(connection.state(), State::Closed);
        assert_eq!(connection.wait_closed().await, None);
    }

    #[test(tokio::test)]
    async fn close_is_idempotent() {
        let (connection, _handle) = open_connection().await;
        let mut events = connection.subscribe();

        connection.close().await;
        connection.close().await;

        let event = events.recv_with_timeout(RECV_TIMEOUT, |_| true).await.unwrap();
        assert_eq!(event, ConnectionEvent::Closed);
        assert!(
            events
                .recv_with_timeout(Duration::from_millis(20), |_| true)
                .await
                .is_err()
        );
    }
}
