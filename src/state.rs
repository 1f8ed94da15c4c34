use crate::realtime::connection::ConnectionHandle;
use crate::realtime::endpoints::{events_target, ticker_target};
use crate::realtime::invalidation::BroadcastInvalidator;
use crate::realtime::jobs::{HttpJobStatusSource, JobPoller};
use crate::realtime::notifications::NotificationCenter;
use crate::realtime::store::EventStateStore;
use crate::realtime::tickers::TickerAggregator;
use crate::realtime::types::{
    ConnectionStatusSnapshot, EventEnvelope, SyncConfig, TickerBatchWire,
};
use parking_lot::RwLock;
use reqwest::Client;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct SyncSessionHandle {
    pub events: ConnectionHandle<EventEnvelope>,
    pub tickers: ConnectionHandle<TickerBatchWire>,
    pub consumers: Vec<JoinHandle<()>>,
}

pub struct SyncState {
    pub started_at: Instant,
    pub http_client: Client,
    pub config: RwLock<SyncConfig>,
    pub store: Arc<EventStateStore>,
    pub tickers: Arc<RwLock<TickerAggregator>>,
    pub ticker_status: Arc<RwLock<ConnectionStatusSnapshot>>,
    pub invalidator: Arc<BroadcastInvalidator>,
    pub notifications: Arc<NotificationCenter>,
    pub sync_session: Mutex<Option<SyncSessionHandle>>,
}

impl SyncState {
    pub fn new(config: SyncConfig) -> Self {
        let events = events_target(&config);
        let tickers = ticker_target(&config);
        let ticker_status = ConnectionStatusSnapshot::closed(
            tickers.name,
            tickers.url,
            Some("sync idle".to_string()),
        );

        Self {
            started_at: Instant::now(),
            http_client: Client::new(),
            config: RwLock::new(config),
            store: Arc::new(EventStateStore::new(events.url)),
            tickers: Arc::new(RwLock::new(TickerAggregator::default())),
            ticker_status: Arc::new(RwLock::new(ticker_status)),
            invalidator: Arc::new(BroadcastInvalidator::default()),
            notifications: Arc::new(NotificationCenter::default()),
            sync_session: Mutex::new(None),
        }
    }

    /// Job poller bound to the current base URL, jobs path and token.
    pub fn job_poller(&self) -> JobPoller<HttpJobStatusSource> {
        let config = self.config.read();
        let source = HttpJobStatusSource::new(self.http_client.clone(), &config);
        JobPoller::new(Arc::new(source), config.job_poll_interval)
    }
}
