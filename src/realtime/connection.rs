//! Managed WebSocket connection for one logical endpoint.
//!
//! [`start`] spawns a task that owns the socket and the [`ConnectionLifecycle`]
//! state machine. Callers talk to it through the returned [`ConnectionHandle`]:
//! status snapshots arrive on a watch channel, decoded frames on an mpsc
//! channel, and commands (`send`, `reconnect_now`) go the other way. Every
//! suspension point in the task races the cancellation token, so nothing that
//! was pending when [`ConnectionHandle::stop`] ran can act afterwards.

use crate::error::SyncError;
use crate::realtime::endpoints::{connect_stream, SyncWsStream};
use crate::realtime::types::{
    ConnectionState, ConnectionStatusSnapshot, EndpointTarget, ReconnectPolicy,
};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const FRAME_CHANNEL_CAPACITY: usize = 1_024;
const CLOSE_GRACE_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Retry { delay: Duration, attempt: u32 },
    Terminal,
}

/// Reconnect state machine, free of any I/O.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    endpoint: EndpointTarget,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    next_retry_delay: Option<Duration>,
    stopped: bool,
    reason: Option<String>,
}

impl ConnectionLifecycle {
    pub fn new(endpoint: EndpointTarget, policy: ReconnectPolicy) -> Self {
        Self {
            endpoint,
            policy,
            state: ConnectionState::Connecting,
            attempt: 0,
            next_retry_delay: None,
            stopped: false,
            reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Enters Connecting. Returns `false` once the lifecycle has stopped.
    pub fn begin_connect(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.state = ConnectionState::Connecting;
        self.next_retry_delay = None;
        self.reason = Some(if self.attempt == 0 {
            "opening websocket".to_string()
        } else {
            format!("reconnect attempt {}", self.attempt)
        });
        true
    }

    pub fn on_open(&mut self) {
        if self.stopped {
            return;
        }
        self.state = ConnectionState::Open;
        self.attempt = 0;
        self.next_retry_delay = None;
        self.reason = Some("websocket connected".to_string());
    }

    pub fn on_close(&mut self, reason: String) -> CloseOutcome {
        self.reason = Some(reason);
        self.next_retry_delay = None;
        if self.stopped || !self.policy.auto_reconnect {
            self.stopped = true;
            self.state = ConnectionState::Closed;
            return CloseOutcome::Terminal;
        }

        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.state = ConnectionState::Reconnecting;
        self.next_retry_delay = Some(delay);
        CloseOutcome::Retry {
            delay,
            attempt: self.attempt,
        }
    }

    /// Drops any scheduled retry and restarts from attempt zero. No-op once
    /// stopped.
    pub fn reconnect_now(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.attempt = 0;
        self.next_retry_delay = None;
        self.state = ConnectionState::Connecting;
        self.reason = Some("manual reconnect".to_string());
        true
    }

    pub fn stop(&mut self, reason: Option<String>) {
        self.stopped = true;
        self.state = ConnectionState::Closed;
        self.next_retry_delay = None;
        if reason.is_some() {
            self.reason = reason;
        }
    }

    pub fn snapshot(&self) -> ConnectionStatusSnapshot {
        ConnectionStatusSnapshot {
            state: self.state,
            endpoint: self.endpoint.name.clone(),
            url: self.endpoint.url.clone(),
            attempt: self.attempt,
            next_retry_delay_ms: self
                .next_retry_delay
                .map(|delay| delay.as_millis().min(u64::MAX as u128) as u64),
            auto_reconnect: self.policy.auto_reconnect && !self.stopped,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug)]
enum ConnectionCommand {
    Send(String),
    ReconnectNow,
}

enum SessionEnd {
    Closed(String),
    ReconnectNow,
    Cancelled,
}

enum RetryDirective {
    Connect,
    Stop,
}

pub struct ConnectionHandle<T> {
    endpoint: EndpointTarget,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    status: watch::Receiver<ConnectionStatusSnapshot>,
    frames: Option<mpsc::Receiver<T>>,
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl<T> ConnectionHandle<T> {
    pub fn endpoint(&self) -> &EndpointTarget {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatusSnapshot> {
        self.status.clone()
    }

    /// Hands the frame receiver to a dedicated consumer. Returns `None` if it
    /// was already taken.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<T>> {
        self.frames.take()
    }

    pub async fn next_frame(&mut self) -> Option<T> {
        match self.frames.as_mut() {
            Some(frames) => frames.recv().await,
            None => None,
        }
    }

    /// Queues `message` for the open socket. Dropped silently when the
    /// connection is not open.
    pub fn send(&self, message: impl Into<String>) {
        if !self.status.borrow().is_open() {
            tracing::trace!(endpoint = %self.endpoint.name, "dropping outbound message while not open");
            return;
        }
        let _ = self.commands.send(ConnectionCommand::Send(message.into()));
    }

    pub fn reconnect_now(&self) {
        let _ = self.commands.send(ConnectionCommand::ReconnectNow);
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Closes the socket, cancels pending retries and waits for the task to
    /// wind down. Returns the final status.
    pub async fn stop(mut self) -> ConnectionStatusSnapshot {
        self.cancellation_token.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
        self.status.borrow().clone()
    }
}

impl<T> Drop for ConnectionHandle<T> {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Spawns the connection task for `endpoint`. Frames are decoded as `T`;
/// frames that fail to decode are dropped without disturbing the connection.
pub fn start<T>(endpoint: EndpointTarget, policy: ReconnectPolicy) -> ConnectionHandle<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let lifecycle = ConnectionLifecycle::new(endpoint.clone(), policy);
    let (status_tx, status_rx) = watch::channel(lifecycle.snapshot());
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();

    let join_handle = tokio::spawn(async move {
        run_connection(lifecycle, status_tx, command_rx, frame_tx, task_token).await;
    });

    ConnectionHandle {
        endpoint,
        commands: command_tx,
        status: status_rx,
        frames: Some(frame_rx),
        cancellation_token,
        join_handle: Some(join_handle),
    }
}

fn publish(status_tx: &watch::Sender<ConnectionStatusSnapshot>, lifecycle: &ConnectionLifecycle) {
    status_tx.send_replace(lifecycle.snapshot());
}

async fn run_connection<T>(
    mut lifecycle: ConnectionLifecycle,
    status_tx: watch::Sender<ConnectionStatusSnapshot>,
    mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    frame_tx: mpsc::Sender<T>,
    cancel_token: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
{
    let endpoint = lifecycle.endpoint.clone();

    'connect: loop {
        if cancel_token.is_cancelled() || !lifecycle.begin_connect() {
            break;
        }
        publish(&status_tx, &lifecycle);
        tracing::debug!(endpoint = %endpoint.name, url = %endpoint.url, attempt = lifecycle.attempt(), "connecting");

        let connect = connect_stream(&endpoint.url);
        tokio::pin!(connect);
        let connect_result = loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break 'connect,
                Some(command) = command_rx.recv() => match command {
                    ConnectionCommand::ReconnectNow => {
                        lifecycle.reconnect_now();
                        continue 'connect;
                    }
                    ConnectionCommand::Send(_) => {
                        tracing::trace!(endpoint = %endpoint.name, "dropping outbound message while connecting");
                    }
                },
                result = &mut connect => break result,
            }
        };

        let close_reason = match connect_result {
            Ok(stream) => {
                lifecycle.on_open();
                publish(&status_tx, &lifecycle);
                tracing::info!(endpoint = %endpoint.name, url = %endpoint.url, "websocket connected");

                match run_session(stream, &endpoint, &mut command_rx, &frame_tx, &cancel_token).await
                {
                    SessionEnd::Cancelled => break,
                    SessionEnd::ReconnectNow => {
                        lifecycle.reconnect_now();
                        continue;
                    }
                    SessionEnd::Closed(reason) => reason,
                }
            }
            Err(error) => format!("websocket connect failed: {error}"),
        };

        match wait_for_retry(
            &mut lifecycle,
            close_reason,
            &status_tx,
            &mut command_rx,
            &cancel_token,
        )
        .await
        {
            RetryDirective::Connect => continue,
            RetryDirective::Stop => break,
        }
    }

    if !lifecycle.is_stopped() {
        lifecycle.stop(Some("connection stopped".to_string()));
    }
    publish(&status_tx, &lifecycle);
    tracing::info!(endpoint = %endpoint.name, "connection closed");
}

async fn wait_for_retry(
    lifecycle: &mut ConnectionLifecycle,
    reason: String,
    status_tx: &watch::Sender<ConnectionStatusSnapshot>,
    command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
    cancel_token: &CancellationToken,
) -> RetryDirective {
    if cancel_token.is_cancelled() {
        return RetryDirective::Stop;
    }

    let outcome = lifecycle.on_close(reason.clone());
    publish(status_tx, lifecycle);

    let delay = match outcome {
        CloseOutcome::Terminal => {
            tracing::info!(endpoint = %lifecycle.endpoint.name, reason = %reason, "auto-reconnect disabled, closing");
            return RetryDirective::Stop;
        }
        CloseOutcome::Retry { delay, attempt } => {
            tracing::warn!(
                endpoint = %lifecycle.endpoint.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "connection lost, scheduling reconnect"
            );
            delay
        }
    };

    let retry_timer = tokio::time::sleep(delay);
    tokio::pin!(retry_timer);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return RetryDirective::Stop,
            Some(command) = command_rx.recv() => match command {
                ConnectionCommand::ReconnectNow => {
                    lifecycle.reconnect_now();
                    return RetryDirective::Connect;
                }
                ConnectionCommand::Send(_) => {
                    tracing::trace!(endpoint = %lifecycle.endpoint.name, "dropping outbound message while reconnecting");
                }
            },
            _ = &mut retry_timer => return RetryDirective::Connect,
        }
    }
}

fn decode_frame<T: DeserializeOwned>(mut payload: Vec<u8>) -> Result<T, SyncError> {
    Ok(simd_json::serde::from_slice(payload.as_mut_slice())?)
}

async fn run_session<T>(
    stream: SyncWsStream,
    endpoint: &EndpointTarget,
    command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
    frame_tx: &mpsc::Sender<T>,
    cancel_token: &CancellationToken,
) -> SessionEnd
where
    T: DeserializeOwned + Send + 'static,
{
    let (mut sink, mut source) = stream.split();

    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                let _ = tokio::time::timeout(Duration::from_millis(CLOSE_GRACE_MS), sink.close()).await;
                return SessionEnd::Cancelled;
            }
            Some(command) = command_rx.recv() => {
                match command {
                    ConnectionCommand::Send(text) => {
                        if let Err(error) = sink.send(Message::Text(text)).await {
                            return SessionEnd::Closed(format!("websocket send failed: {error}"));
                        }
                    }
                    ConnectionCommand::ReconnectNow => {
                        let _ = tokio::time::timeout(Duration::from_millis(CLOSE_GRACE_MS), sink.close()).await;
                        return SessionEnd::ReconnectNow;
                    }
                }
                continue;
            }
            next_message = source.next() => match next_message {
                None => return SessionEnd::Closed("websocket stream ended".to_string()),
                // The close that follows a transport error is this same event.
                Some(Err(error)) => return SessionEnd::Closed(format!("websocket error: {error}")),
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(Message::Ping(data))) => {
                    if let Err(error) = sink.send(Message::Pong(data)).await {
                        return SessionEnd::Closed(format!("websocket pong failed: {error}"));
                    }
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| format!("server closed: {} {}", frame.code, frame.reason))
                        .unwrap_or_else(|| "server closed".to_string());
                    return SessionEnd::Closed(reason);
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
            },
        };

        match decode_frame::<T>(payload) {
            Ok(frame) => {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => return SessionEnd::Cancelled,
                    sent = frame_tx.send(frame) => {
                        if sent.is_err() {
                            tracing::trace!(endpoint = %endpoint.name, "frame consumer gone, discarding frame");
                        }
                    }
                }
            }
            Err(error) => {
                tracing::debug!(endpoint = %endpoint.name, error = %error, "dropping undecodable frame");
            }
        }
    }
}
