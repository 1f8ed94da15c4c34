use crate::error::SyncError;
use crate::realtime::types::ConnectionStatusSnapshot;
use crate::state::SyncState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub events: &'static str,
    pub tickers: &'static str,
}

pub fn build_health_response(
    started_at: Instant,
    events: &ConnectionStatusSnapshot,
    tickers: &ConnectionStatusSnapshot,
) -> HealthResponse {
    let status = if events.is_open() && tickers.is_open() {
        "ok"
    } else {
        "degraded"
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        events: events.state.as_str(),
        tickers: tickers.state.as_str(),
    }
}

pub async fn health(state: &SyncState) -> Result<HealthResponse, SyncError> {
    let events = state.store.connection();
    let tickers = state.ticker_status.read().clone();
    Ok(build_health_response(state.started_at, &events, &tickers))
}
