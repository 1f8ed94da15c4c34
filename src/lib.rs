pub mod commands;
pub mod error;
pub mod realtime;
pub mod state;
pub mod telemetry;

pub use commands::{
    health::health,
    sync_stream::{
        dismiss_notification, event_state, notifications, realtime_sync_status,
        reconnect_realtime_sync, start_realtime_sync, stop_realtime_sync, ticker_snapshot,
        watch_job,
    },
};
pub use error::{Result, SyncError};
pub use state::SyncState;

use realtime::types::SyncConfigArgs;
use std::time::Duration;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the sync layer headless until ctrl-c, with configuration taken from
/// the `REALTIME_*` environment variables.
pub async fn run() -> Result<()> {
    let args = SyncConfigArgs::from_env()?;
    let state = SyncState::new(args.clone().normalize()?);
    let session = start_realtime_sync(&state, Some(args)).await?;
    tracing::info!(
        events_url = %session.events_url,
        ticker_url = %session.ticker_url,
        "realtime sync running, press ctrl-c to stop"
    );

    let mut status_interval = tokio::time::interval(STATUS_LOG_INTERVAL);
    status_interval.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = status_interval.tick() => {
                let health = health(&state).await?;
                let tickers = state.tickers.read().len();
                tracing::info!(
                    status = health.status,
                    events = health.events,
                    tickers = health.tickers,
                    symbols = tickers,
                    uptime_ms = health.uptime_ms as u64,
                    "sync status"
                );
            }
        }
    }

    let stopped = stop_realtime_sync(&state).await?;
    tracing::info!(stopped = stopped.stopped, "realtime sync shut down");
    Ok(())
}
