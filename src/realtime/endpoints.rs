use crate::error::SyncError;
use crate::realtime::types::{
    BackgroundJob, EndpointTarget, SyncConfig, EVENTS_ENDPOINT_NAME, TICKER_ENDPOINT_NAME,
};
use reqwest::{Client, Url};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type SyncWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn websocket_base_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

fn http_base_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        base_url.to_string()
    }
}

pub fn websocket_url(base_url: &str, path: &str) -> String {
    format!("{}{path}", websocket_base_url(base_url.trim_end_matches('/')))
}

pub fn events_target(config: &SyncConfig) -> EndpointTarget {
    EndpointTarget {
        name: EVENTS_ENDPOINT_NAME.to_string(),
        url: websocket_url(&config.base_url, &config.events_path),
    }
}

pub fn ticker_target(config: &SyncConfig) -> EndpointTarget {
    EndpointTarget {
        name: TICKER_ENDPOINT_NAME.to_string(),
        url: websocket_url(&config.base_url, &config.ticker_path),
    }
}

pub fn job_status_url(base_url: &str, jobs_path: &str, job_id: &str) -> Result<Url, SyncError> {
    let root = format!("{}{jobs_path}", http_base_url(base_url.trim_end_matches('/')));
    let mut url = Url::parse(&root)
        .map_err(|error| SyncError::InvalidArgument(format!("invalid job status url: {error}")))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::InvalidArgument("base url cannot carry a path".to_string()))?
        .pop_if_empty()
        .push(job_id);
    Ok(url)
}

pub async fn connect_stream(url: &str) -> Result<SyncWsStream, SyncError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_job_status(
    client: &Client,
    url: Url,
    auth_token: Option<&str>,
) -> Result<BackgroundJob, SyncError> {
    let endpoint = url.to_string();
    let mut request = client.get(url);
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SyncError::UnexpectedStatus {
            status: status.as_u16(),
            endpoint,
        });
    }
    let job = response.json::<BackgroundJob>().await?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::types::SyncConfigArgs;

    #[test]
    fn websocket_url_maps_http_schemes() {
        assert_eq!(
            websocket_url("http://localhost:8000", "/ws/events"),
            "ws://localhost:8000/ws/events"
        );
        assert_eq!(
            websocket_url("https://desk.example.com/", "/ws/tickers"),
            "wss://desk.example.com/ws/tickers"
        );
        assert_eq!(
            websocket_url("wss://desk.example.com", "/ws/events"),
            "wss://desk.example.com/ws/events"
        );
    }

    #[test]
    fn targets_follow_config_paths() {
        let config = SyncConfigArgs {
            base_url: Some("https://desk.example.com".to_string()),
            events_path: Some("/stream/system".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("config should be valid");

        let events = events_target(&config);
        assert_eq!(events.name, "events");
        assert_eq!(events.url, "wss://desk.example.com/stream/system");
        assert_eq!(ticker_target(&config).url, "wss://desk.example.com/ws/tickers");
    }

    #[test]
    fn job_status_url_encodes_job_id() {
        let url = job_status_url("ws://localhost:8000", "/api/jobs", "job 1/2")
            .expect("job url should build");
        assert_eq!(url.as_str(), "http://localhost:8000/api/jobs/job%201%2F2");
    }

    #[test]
    fn job_status_url_under_root_path() {
        let url = job_status_url("https://desk.example.com", "/", "job-9")
            .expect("job url should build");
        assert_eq!(url.as_str(), "https://desk.example.com/job-9");
    }
}
