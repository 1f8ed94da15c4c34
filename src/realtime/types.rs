use crate::error::SyncError;
use crate::realtime::wire;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_EVENTS_PATH: &str = "/ws/events";
pub const DEFAULT_TICKER_PATH: &str = "/ws/tickers";
pub const DEFAULT_JOBS_PATH: &str = "/api/jobs";
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_AUTO_RECONNECT: bool = true;
pub const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 2_000;
pub const MIN_BASE_DELAY_MS: u64 = 100;
pub const MAX_BASE_DELAY_MS: u64 = 60_000;
pub const MAX_MAX_DELAY_MS: u64 = 600_000;
pub const MIN_JOB_POLL_INTERVAL_MS: u64 = 250;
pub const MAX_JOB_POLL_INTERVAL_MS: u64 = 60_000;

pub const EVENTS_ENDPOINT_NAME: &str = "events";
pub const TICKER_ENDPOINT_NAME: &str = "tickers";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub auto_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            auto_reconnect: DEFAULT_AUTO_RECONNECT,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`, saturating at the ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusSnapshot {
    pub state: ConnectionState,
    pub endpoint: String,
    pub url: String,
    pub attempt: u32,
    pub next_retry_delay_ms: Option<u64>,
    pub auto_reconnect: bool,
    pub reason: Option<String>,
}

impl ConnectionStatusSnapshot {
    pub fn closed(endpoint: String, url: String, reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Closed,
            endpoint,
            url,
            attempt: 0,
            next_retry_delay_ms: None,
            auto_reconnect: false,
            reason,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigArgs {
    pub base_url: Option<String>,
    pub events_path: Option<String>,
    pub ticker_path: Option<String>,
    pub jobs_path: Option<String>,
    pub auth_token: Option<String>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub auto_reconnect: Option<bool>,
    pub job_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub events_path: String,
    pub ticker_path: String,
    pub jobs_path: String,
    pub auth_token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub job_poll_interval: Duration,
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>, SyncError> {
    env_value(key)
        .map(|raw| {
            raw.parse::<u64>().map_err(|_| {
                SyncError::InvalidArgument(format!("{key} must be an unsigned integer"))
            })
        })
        .transpose()
}

fn env_bool(key: &str) -> Result<Option<bool>, SyncError> {
    env_value(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(SyncError::InvalidArgument(format!(
                "{key} must be a boolean"
            ))),
        })
        .transpose()
}

fn normalize_path(field: &str, value: Option<String>, default: &str) -> Result<String, SyncError> {
    let path = value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| default.to_string());

    if !path.starts_with('/') || path.chars().any(char::is_whitespace) {
        return Err(SyncError::InvalidArgument(format!(
            "{field} must be an absolute path without whitespace"
        )));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    Ok(trimmed.to_string())
}

impl SyncConfigArgs {
    pub fn from_env() -> Result<Self, SyncError> {
        Ok(Self {
            base_url: env_value("REALTIME_BASE_URL"),
            events_path: env_value("REALTIME_EVENTS_PATH"),
            ticker_path: env_value("REALTIME_TICKER_PATH"),
            jobs_path: env_value("REALTIME_JOBS_PATH"),
            auth_token: env_value("REALTIME_AUTH_TOKEN"),
            base_delay_ms: env_u64("REALTIME_BASE_DELAY_MS")?,
            max_delay_ms: env_u64("REALTIME_MAX_DELAY_MS")?,
            auto_reconnect: env_bool("REALTIME_AUTO_RECONNECT")?,
            job_poll_interval_ms: env_u64("REALTIME_JOB_POLL_INTERVAL_MS")?,
        })
    }

    pub fn normalize(self) -> Result<SyncConfig, SyncError> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| base_url.starts_with(scheme) && base_url.len() > scheme.len());
        if !scheme_ok {
            return Err(SyncError::InvalidArgument(
                "baseUrl must start with http://, https://, ws:// or wss:// and name a host"
                    .to_string(),
            ));
        }

        let events_path = normalize_path("eventsPath", self.events_path, DEFAULT_EVENTS_PATH)?;
        let ticker_path = normalize_path("tickerPath", self.ticker_path, DEFAULT_TICKER_PATH)?;
        let jobs_path = normalize_path("jobsPath", self.jobs_path, DEFAULT_JOBS_PATH)?;
        let auth_token = self
            .auth_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        let base_delay_ms = self.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS);
        if !(MIN_BASE_DELAY_MS..=MAX_BASE_DELAY_MS).contains(&base_delay_ms) {
            return Err(SyncError::InvalidArgument(format!(
                "baseDelayMs must be between {MIN_BASE_DELAY_MS} and {MAX_BASE_DELAY_MS}"
            )));
        }

        let max_delay_ms = self.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS);
        if !(base_delay_ms..=MAX_MAX_DELAY_MS).contains(&max_delay_ms) {
            return Err(SyncError::InvalidArgument(format!(
                "maxDelayMs must be between baseDelayMs and {MAX_MAX_DELAY_MS}"
            )));
        }

        let job_poll_interval_ms = self
            .job_poll_interval_ms
            .unwrap_or(DEFAULT_JOB_POLL_INTERVAL_MS);
        if !(MIN_JOB_POLL_INTERVAL_MS..=MAX_JOB_POLL_INTERVAL_MS).contains(&job_poll_interval_ms)
        {
            return Err(SyncError::InvalidArgument(format!(
                "jobPollIntervalMs must be between {MIN_JOB_POLL_INTERVAL_MS} and {MAX_JOB_POLL_INTERVAL_MS}"
            )));
        }

        Ok(SyncConfig {
            base_url,
            events_path,
            ticker_path,
            jobs_path,
            auth_token,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                auto_reconnect: self.auto_reconnect.unwrap_or(DEFAULT_AUTO_RECONNECT),
            },
            job_poll_interval: Duration::from_millis(job_poll_interval_ms),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub running: bool,
    pub events_url: String,
    pub ticker_url: String,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReconnectResult {
    pub requested: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub events: ConnectionStatusSnapshot,
    pub tickers: ConnectionStatusSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    HaltStatus,
    OrderUpdate,
    RiskAlert,
    NewsUpdate,
    SentimentUpdate,
    SchedulerEvent,
    RegimeChange,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HaltStatus => "halt_status",
            Self::OrderUpdate => "order_update",
            Self::RiskAlert => "risk_alert",
            Self::NewsUpdate => "news_update",
            Self::SentimentUpdate => "sentiment_update",
            Self::SchedulerEvent => "scheduler_event",
            Self::RegimeChange => "regime_change",
        }
    }

    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "halt_status" => Some(Self::HaltStatus),
            "order_update" => Some(Self::OrderUpdate),
            "risk_alert" => Some(Self::RiskAlert),
            "news_update" => Some(Self::NewsUpdate),
            "sentiment_update" => Some(Self::SentimentUpdate),
            "scheduler_event" => Some(Self::SchedulerEvent),
            "regime_change" => Some(Self::RegimeChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HaltStatus {
    pub is_halted: bool,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub halt_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrderUpdate {
    #[serde(default, deserialize_with = "wire::text")]
    pub order_id: String,
    #[serde(default, deserialize_with = "wire::text")]
    pub symbol: String,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "wire::text")]
    pub status: String,
    #[serde(default, deserialize_with = "wire::number")]
    pub filled_quantity: f64,
    #[serde(default, deserialize_with = "wire::opt_number")]
    pub avg_fill_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RiskAlert {
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub alert_type: Option<String>,
    #[serde(default, deserialize_with = "wire::text")]
    pub message: String,
    #[serde(default, deserialize_with = "wire::text")]
    pub severity: String,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewsUpdate {
    #[serde(default, deserialize_with = "wire::count")]
    pub articles_fetched: u64,
    #[serde(default, deserialize_with = "wire::null_as_default")]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SentimentUpdate {
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_number")]
    pub score: Option<f64>,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SchedulerEvent {
    #[serde(default, deserialize_with = "wire::text")]
    pub job_name: String,
    #[serde(default, deserialize_with = "wire::text")]
    pub status: String,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RegimeChange {
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub previous_regime: Option<String>,
    #[serde(default, deserialize_with = "wire::text")]
    pub new_regime: String,
    #[serde(default, deserialize_with = "wire::opt_number")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "wire::opt_text")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    HaltStatus(HaltStatus),
    OrderUpdate(OrderUpdate),
    RiskAlert(RiskAlert),
    NewsUpdate(NewsUpdate),
    SentimentUpdate(SentimentUpdate),
    SchedulerEvent(SchedulerEvent),
    RegimeChange(RegimeChange),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::HaltStatus(_) => EventKind::HaltStatus,
            Self::OrderUpdate(_) => EventKind::OrderUpdate,
            Self::RiskAlert(_) => EventKind::RiskAlert,
            Self::NewsUpdate(_) => EventKind::NewsUpdate,
            Self::SentimentUpdate(_) => EventKind::SentimentUpdate,
            Self::SchedulerEvent(_) => EventKind::SchedulerEvent,
            Self::RegimeChange(_) => EventKind::RegimeChange,
        }
    }
}

/// `{ "type": ..., "data": ... }` as received on the events endpoint. The
/// payload stays untyped until the tag has been classified.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub data: OwnedValue,
}

impl ServerEvent {
    /// Decodes `data` as the payload of `kind`.
    pub fn from_payload(kind: EventKind, data: OwnedValue) -> Result<Self, SyncError> {
        let event = match kind {
            EventKind::HaltStatus => Self::HaltStatus(simd_json::serde::from_owned_value(data)?),
            EventKind::OrderUpdate => Self::OrderUpdate(simd_json::serde::from_owned_value(data)?),
            EventKind::RiskAlert => Self::RiskAlert(simd_json::serde::from_owned_value(data)?),
            EventKind::NewsUpdate => Self::NewsUpdate(simd_json::serde::from_owned_value(data)?),
            EventKind::SentimentUpdate => {
                Self::SentimentUpdate(simd_json::serde::from_owned_value(data)?)
            }
            EventKind::SchedulerEvent => {
                Self::SchedulerEvent(simd_json::serde::from_owned_value(data)?)
            }
            EventKind::RegimeChange => {
                Self::RegimeChange(simd_json::serde::from_owned_value(data)?)
            }
        };
        Ok(event)
    }
}

impl EventEnvelope {
    /// Classifies the `type` tag without touching `data`.
    pub fn kind(&self) -> Result<EventKind, SyncError> {
        let tag = self
            .event_type
            .as_deref()
            .ok_or_else(|| SyncError::Protocol("envelope is missing 'type'".to_string()))?;
        EventKind::parse_str(tag)
            .ok_or_else(|| SyncError::Protocol(format!("unrecognized event type '{tag}'")))
    }
}

impl TryFrom<EventEnvelope> for ServerEvent {
    type Error = SyncError;

    fn try_from(value: EventEnvelope) -> Result<Self, Self::Error> {
        let kind = value.kind()?;
        Self::from_payload(kind, value.data)
    }
}

pub fn parse_event_payload(payload: &mut [u8]) -> Result<ServerEvent, SyncError> {
    let envelope: EventEnvelope = simd_json::serde::from_slice(payload)?;
    envelope.try_into()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub kind: EventKind,
    pub invalidated: &'static [&'static str],
    pub notification: Option<Notification>,
}

/// One ticker record. Every field is optional on the wire so that a single
/// malformed record is rejected on its own in [`TickerBatchWire::into_records`].
#[derive(Debug, Deserialize)]
pub struct TickerWire {
    #[serde(default, deserialize_with = "wire::text")]
    pub symbol: String,
    #[serde(default, deserialize_with = "wire::opt_number")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "wire::number")]
    pub volume_24h: f64,
    #[serde(default, deserialize_with = "wire::number")]
    pub change_24h: f64,
    #[serde(default, deserialize_with = "wire::opt_unix_ms")]
    pub timestamp: Option<i64>,
}

/// `{ "tickers": [...] }`. Records stay untyped until [`Self::into_records`]
/// so one bad record cannot sink the batch.
#[derive(Debug, Deserialize)]
pub struct TickerBatchWire {
    #[serde(default, deserialize_with = "wire::null_as_default")]
    pub tickers: Vec<OwnedValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TickerRecord {
    pub symbol: String,
    pub price: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TickerQuote {
    pub price: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub timestamp: i64,
}

impl TickerBatchWire {
    /// Converts the batch record by record. Records that are not objects, lack
    /// a symbol, or lack a usable price are skipped. Symbols are kept as sent
    /// apart from surrounding whitespace. Missing timestamps take
    /// `received_at_ms`.
    pub fn into_records(self, received_at_ms: i64) -> Vec<TickerRecord> {
        self.tickers
            .into_iter()
            .filter_map(|value| match simd_json::serde::from_owned_value::<TickerWire>(value) {
                Ok(ticker) => Some(ticker),
                Err(error) => {
                    tracing::debug!(error = %error, "skipping malformed ticker record");
                    None
                }
            })
            .filter_map(|ticker| {
                let symbol = ticker.symbol.trim();
                let price = ticker.price?;
                if symbol.is_empty() {
                    return None;
                }
                Some(TickerRecord {
                    symbol: symbol.to_string(),
                    price,
                    volume_24h: ticker.volume_24h,
                    change_24h: ticker.change_24h,
                    timestamp: ticker.timestamp.unwrap_or(received_at_ms),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackgroundJob {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub progress_message: Option<String>,
    #[serde(default)]
    pub result: Option<OwnedValue>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl BackgroundJob {
    pub fn progress_fraction(&self) -> f64 {
        if self.progress.is_finite() {
            self.progress.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}
