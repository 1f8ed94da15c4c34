use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {status} from {endpoint}")]
    UnexpectedStatus { status: u16, endpoint: String },
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Transport failures are recovered by the reconnect loop; everything else
    /// is surfaced to whoever asked.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Io(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
