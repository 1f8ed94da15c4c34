use crate::error::SyncError;
use crate::realtime::connection::{self, ConnectionHandle};
use crate::realtime::dispatcher::EventDispatcher;
use crate::realtime::endpoints::{events_target, ticker_target};
use crate::realtime::invalidation::CacheInvalidator;
use crate::realtime::jobs::JobWatch;
use crate::realtime::notifications::{NotificationEntry, NotificationSink};
use crate::realtime::store::EventStateSnapshot;
use crate::realtime::tickers::{TickerAggregator, TickerSnapshot};
use crate::realtime::types::{
    ConnectionStatusSnapshot, EventEnvelope, SyncConfig, SyncConfigArgs, SyncReconnectResult,
    SyncSession, SyncStatusSnapshot, SyncStopResult, TickerBatchWire,
};
use crate::state::{SyncSessionHandle, SyncState};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

fn session_summary(config: &SyncConfig) -> SyncSession {
    SyncSession {
        running: true,
        events_url: events_target(config).url,
        ticker_url: ticker_target(config).url,
        base_delay_ms: config.reconnect.base_delay.as_millis() as u64,
        max_delay_ms: config.reconnect.max_delay.as_millis() as u64,
        auto_reconnect: config.reconnect.auto_reconnect,
    }
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

async fn shutdown_session(handle: SyncSessionHandle) {
    let SyncSessionHandle {
        events,
        tickers,
        consumers,
    } = handle;

    let (events_status, tickers_status) = tokio::join!(events.stop(), tickers.stop());
    for consumer in consumers {
        let _ = consumer.await;
    }
    tracing::info!(
        events = events_status.state.as_str(),
        tickers = tickers_status.state.as_str(),
        "realtime sync session stopped"
    );
}

async fn consume_events(
    dispatcher: EventDispatcher,
    mut frames: mpsc::Receiver<EventEnvelope>,
    mut status: watch::Receiver<ConnectionStatusSnapshot>,
) {
    let store = Arc::clone(dispatcher.store());
    store.set_connection(status.borrow_and_update().clone());

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(envelope) => {
                    dispatcher.dispatch_envelope(envelope);
                }
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                store.set_connection(status.borrow_and_update().clone());
            }
        }
    }

    store.set_connection(status.borrow().clone());
}

async fn consume_tickers(
    aggregator: Arc<RwLock<TickerAggregator>>,
    ticker_status: Arc<RwLock<ConnectionStatusSnapshot>>,
    mut frames: mpsc::Receiver<TickerBatchWire>,
    mut status: watch::Receiver<ConnectionStatusSnapshot>,
) {
    *ticker_status.write() = status.borrow_and_update().clone();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(batch) => {
                    let records = batch.into_records(now_unix_ms());
                    let applied = aggregator.write().apply_batch(records);
                    tracing::trace!(applied, "applied ticker batch");
                }
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                *ticker_status.write() = status.borrow_and_update().clone();
            }
        }
    }

    *ticker_status.write() = status.borrow().clone();
}

fn take_frames<T>(handle: &mut ConnectionHandle<T>) -> Result<mpsc::Receiver<T>, SyncError> {
    handle.take_frames().ok_or_else(|| {
        SyncError::Protocol(format!(
            "frame receiver for '{}' already taken",
            handle.endpoint().name
        ))
    })
}

pub async fn start_realtime_sync(
    state: &SyncState,
    args: Option<SyncConfigArgs>,
) -> Result<SyncSession, SyncError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut session_slot = state.sync_session.lock().await;
        session_slot.take()
    };
    if let Some(handle) = existing_handle {
        shutdown_session(handle).await;
    }

    *state.config.write() = config.clone();

    let mut events = connection::start::<EventEnvelope>(events_target(&config), config.reconnect);
    let mut tickers =
        connection::start::<TickerBatchWire>(ticker_target(&config), config.reconnect);
    let event_frames = take_frames(&mut events)?;
    let ticker_frames = take_frames(&mut tickers)?;

    let dispatcher = EventDispatcher::new(
        Arc::clone(&state.store),
        Arc::clone(&state.invalidator) as Arc<dyn CacheInvalidator>,
        Arc::clone(&state.notifications) as Arc<dyn NotificationSink>,
    );
    let events_consumer = tokio::spawn(consume_events(
        dispatcher,
        event_frames,
        events.subscribe_status(),
    ));
    let tickers_consumer = tokio::spawn(consume_tickers(
        Arc::clone(&state.tickers),
        Arc::clone(&state.ticker_status),
        ticker_frames,
        tickers.subscribe_status(),
    ));

    let session = session_summary(&config);
    tracing::info!(
        events_url = %session.events_url,
        ticker_url = %session.ticker_url,
        base_delay_ms = session.base_delay_ms,
        max_delay_ms = session.max_delay_ms,
        auto_reconnect = session.auto_reconnect,
        "realtime sync session started"
    );

    {
        let mut session_slot = state.sync_session.lock().await;
        *session_slot = Some(SyncSessionHandle {
            events,
            tickers,
            consumers: vec![events_consumer, tickers_consumer],
        });
    }

    Ok(session)
}

pub async fn stop_realtime_sync(state: &SyncState) -> Result<SyncStopResult, SyncError> {
    let existing_handle = {
        let mut session_slot = state.sync_session.lock().await;
        session_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        shutdown_session(handle).await;
        true
    } else {
        false
    };

    let reason = Some("sync stopped by command".to_string());
    let events = state.store.connection();
    state.store.set_connection(ConnectionStatusSnapshot::closed(
        events.endpoint,
        events.url,
        reason.clone(),
    ));
    {
        let mut writable = state.ticker_status.write();
        let closed = ConnectionStatusSnapshot::closed(
            writable.endpoint.clone(),
            writable.url.clone(),
            reason,
        );
        *writable = closed;
    }

    Ok(SyncStopResult { stopped })
}

pub async fn reconnect_realtime_sync(state: &SyncState) -> Result<SyncReconnectResult, SyncError> {
    let session_slot = state.sync_session.lock().await;
    let requested = match session_slot.as_ref() {
        Some(handle) => {
            handle.events.reconnect_now();
            handle.tickers.reconnect_now();
            true
        }
        None => false,
    };
    tracing::info!(requested, "manual reconnect");
    Ok(SyncReconnectResult { requested })
}

pub async fn realtime_sync_status(state: &SyncState) -> Result<SyncStatusSnapshot, SyncError> {
    Ok(SyncStatusSnapshot {
        events: state.store.connection(),
        tickers: state.ticker_status.read().clone(),
    })
}

pub async fn ticker_snapshot(state: &SyncState) -> Result<TickerSnapshot, SyncError> {
    Ok(state.tickers.read().snapshot())
}

pub async fn event_state(state: &SyncState) -> Result<EventStateSnapshot, SyncError> {
    Ok(state.store.snapshot())
}

pub async fn notifications(state: &SyncState) -> Result<Vec<NotificationEntry>, SyncError> {
    Ok(state.notifications.entries())
}

pub async fn dismiss_notification(state: &SyncState, id: u64) -> Result<bool, SyncError> {
    Ok(state.notifications.dismiss(id))
}

/// Starts polling a background job against the configured jobs endpoint.
pub async fn watch_job(state: &SyncState, job_id: Option<&str>) -> Result<JobWatch, SyncError> {
    Ok(state.job_poller().watch(job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::types::ConnectionState;
    use crate::realtime::RISK_STATUS_GROUP;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    const EVENT_FRAMES: [&str; 2] = [
        r#"{"type":"halt_status","data":{"is_halted":true,"halt_reason":"Drawdown exceeded"}}"#,
        r#"{"type":"risk_alert","data":{"message":"Position limit breached","severity":"critical","symbol":"BTCUSDT"}}"#,
    ];
    const TICKER_FRAME: &str =
        r#"{"tickers":[{"symbol":"BTCUSDT","price":50000.0,"volume_24h":10.0,"change_24h":1.5}]}"#;

    /// Serves both endpoints from one listener. Every connection receives the
    /// event frames and the ticker frame; each side drops what it cannot decode.
    async fn spawn_backend() -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have address");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    for frame in EVENT_FRAMES.iter().chain(std::iter::once(&TICKER_FRAME)) {
                        if ws.send(Message::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        format!("http://{addr}")
    }

    fn test_state() -> SyncState {
        let config = SyncConfigArgs::default()
            .normalize()
            .expect("defaults should be valid");
        SyncState::new(config)
    }

    async fn eventually<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition should hold in time");
    }

    #[tokio::test]
    async fn session_feeds_store_tickers_and_notifications() {
        let base_url = spawn_backend().await;
        let state = test_state();
        let mut invalidations = state.invalidator.subscribe();

        let session = start_realtime_sync(
            &state,
            Some(SyncConfigArgs {
                base_url: Some(base_url.clone()),
                base_delay_ms: Some(100),
                max_delay_ms: Some(1_000),
                ..Default::default()
            }),
        )
        .await
        .expect("sync should start");
        assert!(session.running);
        assert_eq!(session.events_url, format!("{}/ws/events", base_url.replace("http", "ws")));

        eventually(|| state.store.last_risk_alert().is_some()).await;
        eventually(|| state.tickers.read().quote("BTCUSDT").is_some()).await;

        let events = event_state(&state).await.expect("event state");
        assert_eq!(events.is_halted, Some(true));
        assert_eq!(events.halt_reason.as_deref(), Some("Drawdown exceeded"));
        assert_eq!(events.connection.state, ConnectionState::Open);

        let tickers = ticker_snapshot(&state).await.expect("ticker snapshot");
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers["BTCUSDT"].price, 50_000.0);

        let entries = notifications(&state).await.expect("notifications");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "Position limit breached");

        assert_eq!(
            invalidations.recv().await.expect("first invalidation"),
            RISK_STATUS_GROUP
        );

        let stopped = stop_realtime_sync(&state).await.expect("stop should succeed");
        assert!(stopped.stopped);
        let status = realtime_sync_status(&state).await.expect("status");
        assert_eq!(status.events.state, ConnectionState::Closed);
        assert_eq!(status.tickers.state, ConnectionState::Closed);

        let again = stop_realtime_sync(&state).await.expect("second stop");
        assert!(!again.stopped);
    }

    #[tokio::test]
    async fn restart_replaces_running_session() {
        let base_url = spawn_backend().await;
        let state = test_state();
        let args = SyncConfigArgs {
            base_url: Some(base_url),
            ..Default::default()
        };

        start_realtime_sync(&state, Some(args.clone()))
            .await
            .expect("first start");
        start_realtime_sync(&state, Some(args))
            .await
            .expect("second start");

        let reconnect = reconnect_realtime_sync(&state).await.expect("reconnect");
        assert!(reconnect.requested);

        assert!(stop_realtime_sync(&state).await.expect("stop").stopped);
        let reconnect = reconnect_realtime_sync(&state).await.expect("reconnect");
        assert!(!reconnect.requested);
    }

    #[tokio::test]
    async fn invalid_args_leave_sync_stopped() {
        let state = test_state();
        let result = start_realtime_sync(
            &state,
            Some(SyncConfigArgs {
                base_delay_ms: Some(10),
                ..Default::default()
            }),
        )
        .await;

        assert!(matches!(result, Err(SyncError::InvalidArgument(_))));
        assert!(state.sync_session.lock().await.is_none());
        let status = realtime_sync_status(&state).await.expect("status");
        assert_eq!(status.events.state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn empty_job_watch_never_reports() {
        let state = test_state();
        let mut watch = watch_job(&state, None).await.expect("watch");
        assert!(watch.job_id().is_none());
        assert!(watch.next().await.is_none());
    }
}
