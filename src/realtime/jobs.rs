use crate::error::SyncError;
use crate::realtime::endpoints::{fetch_job_status, job_status_url};
use crate::realtime::types::{BackgroundJob, JobStatus, SyncConfig};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JOB_UPDATE_CHANNEL_CAPACITY: usize = 16;

#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn fetch_job(&self, job_id: &str) -> Result<BackgroundJob, SyncError>;
}

/// Authenticated GET against `{base_url}{jobs_path}/{job_id}`.
#[derive(Debug, Clone)]
pub struct HttpJobStatusSource {
    client: Client,
    base_url: String,
    jobs_path: String,
    auth_token: Option<String>,
}

impl HttpJobStatusSource {
    pub fn new(client: Client, config: &SyncConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            jobs_path: config.jobs_path.clone(),
            auth_token: config.auth_token.clone(),
        }
    }
}

#[async_trait]
impl JobStatusSource for HttpJobStatusSource {
    async fn fetch_job(&self, job_id: &str) -> Result<BackgroundJob, SyncError> {
        let url = job_status_url(&self.base_url, &self.jobs_path, job_id)?;
        fetch_job_status(&self.client, url, self.auth_token.as_deref()).await
    }
}

/// Delay before the next fetch, or `None` once the job is terminal.
pub fn next_poll_delay(status: JobStatus, interval: Duration) -> Option<Duration> {
    if status.is_terminal() {
        None
    } else {
        Some(interval)
    }
}

pub struct JobPoller<S> {
    source: Arc<S>,
    interval: Duration,
}

impl<S> JobPoller<S>
where
    S: JobStatusSource + 'static,
{
    pub fn new(source: Arc<S>, interval: Duration) -> Self {
        Self { source, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts polling `job_id`. A missing or blank id yields a watch that
    /// never fetches and reports nothing.
    pub fn watch(&self, job_id: Option<&str>) -> JobWatch {
        let (update_tx, update_rx) = mpsc::channel(JOB_UPDATE_CHANNEL_CAPACITY);
        let cancellation_token = CancellationToken::new();

        let job_id = match job_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(job_id) => job_id.to_string(),
            None => {
                return JobWatch {
                    job_id: None,
                    updates: update_rx,
                    cancellation_token,
                    join_handle: None,
                }
            }
        };

        let source = Arc::clone(&self.source);
        let interval = self.interval;
        let task_token = cancellation_token.clone();
        let task_job_id = job_id.clone();
        let join_handle = tokio::spawn(async move {
            poll_job(source, task_job_id, interval, update_tx, task_token).await;
        });

        JobWatch {
            job_id: Some(job_id),
            updates: update_rx,
            cancellation_token,
            join_handle: Some(join_handle),
        }
    }
}

async fn poll_job<S>(
    source: Arc<S>,
    job_id: String,
    interval: Duration,
    update_tx: mpsc::Sender<Result<BackgroundJob, SyncError>>,
    cancel_token: CancellationToken,
) where
    S: JobStatusSource + ?Sized,
{
    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            fetched = source.fetch_job(&job_id) => fetched,
        };

        let delay = match &fetched {
            Ok(job) => next_poll_delay(job.status, interval),
            Err(error) => {
                tracing::warn!(
                    job_id = %job_id,
                    transport = error.is_transport(),
                    error = %error,
                    "job status poll failed"
                );
                None
            }
        };
        if let Ok(job) = &fetched {
            tracing::debug!(job_id = %job_id, status = ?job.status, progress = job.progress_fraction(), "job status fetched");
        }

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            sent = update_tx.send(fetched) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        let Some(delay) = delay else {
            return;
        };

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Observer side of a job watch. Dropping it cancels polling.
pub struct JobWatch {
    job_id: Option<String>,
    updates: mpsc::Receiver<Result<BackgroundJob, SyncError>>,
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl JobWatch {
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Next fetched snapshot in order. `None` after a terminal status, an
    /// error, a cancel, or for an empty watch.
    pub async fn next(&mut self) -> Option<Result<BackgroundJob, SyncError>> {
        self.updates.recv().await
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub async fn finished(mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<BackgroundJob, SyncError>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<BackgroundJob, SyncError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().iter().map(|(_, at)| *at).collect()
        }
    }

    #[async_trait]
    impl JobStatusSource for ScriptedSource {
        async fn fetch_job(&self, job_id: &str) -> Result<BackgroundJob, SyncError> {
            self.calls.lock().push((job_id.to_string(), Instant::now()));
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(job(job_id, JobStatus::Running)))
        }
    }

    fn job(id: &str, status: JobStatus) -> BackgroundJob {
        BackgroundJob {
            id: id.to_string(),
            status,
            progress: if status == JobStatus::Completed { 1.0 } else { 0.4 },
            progress_message: None,
            result: None,
            error: None,
            created_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn poll_delay_stops_on_terminal_states() {
        let interval = Duration::from_millis(2_000);
        assert_eq!(next_poll_delay(JobStatus::Pending, interval), Some(interval));
        assert_eq!(next_poll_delay(JobStatus::Running, interval), Some(interval));
        assert_eq!(next_poll_delay(JobStatus::Completed, interval), None);
        assert_eq!(next_poll_delay(JobStatus::Failed, interval), None);
        assert_eq!(next_poll_delay(JobStatus::Cancelled, interval), None);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_completed() {
        let source = ScriptedSource::new(vec![
            Ok(job("job-1", JobStatus::Running)),
            Ok(job("job-1", JobStatus::Completed)),
        ]);
        let poller = JobPoller::new(Arc::clone(&source), Duration::from_millis(2_000));
        let started = Instant::now();
        let mut watch = poller.watch(Some("job-1"));

        let first = watch.next().await.expect("first update").expect("first fetch ok");
        assert_eq!(first.status, JobStatus::Running);
        let second = watch.next().await.expect("second update").expect("second fetch ok");
        assert_eq!(second.status, JobStatus::Completed);
        assert!(watch.next().await.is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let times = source.call_times();
        assert_eq!(times.len(), 2);
        assert_eq!(times[0] - started, Duration::ZERO);
        assert_eq!(times[1] - times[0], Duration::from_millis(2_000));
        assert!(source.calls.lock().iter().all(|(id, _)| id == "job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_or_blank_id_never_fetches() {
        let source = ScriptedSource::new(Vec::new());
        let poller = JobPoller::new(Arc::clone(&source), Duration::from_millis(2_000));

        let mut none = poller.watch(None);
        let mut blank = poller.watch(Some("  "));
        assert!(none.job_id().is_none());
        assert!(none.next().await.is_none());
        assert!(blank.next().await.is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(source.call_times().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_error_is_reported_and_polling_stops() {
        let source = ScriptedSource::new(vec![
            Ok(job("job-2", JobStatus::Pending)),
            Err(SyncError::UnexpectedStatus {
                status: 503,
                endpoint: "http://localhost:8000/api/jobs/job-2".to_string(),
            }),
        ]);
        let poller = JobPoller::new(Arc::clone(&source), Duration::from_millis(2_000));
        let mut watch = poller.watch(Some("job-2"));

        assert!(watch.next().await.expect("first update").is_ok());
        let failure = watch.next().await.expect("error update");
        assert!(matches!(
            failure,
            Err(SyncError::UnexpectedStatus { status: 503, .. })
        ));
        assert!(watch.next().await.is_none());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.call_times().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_fetches() {
        let source = ScriptedSource::new(Vec::new());
        let poller = JobPoller::new(Arc::clone(&source), Duration::from_millis(2_000));
        let mut watch = poller.watch(Some("job-3"));

        let first = watch.next().await.expect("first update").expect("fetch ok");
        assert_eq!(first.status, JobStatus::Running);
        watch.cancel();
        watch.finished().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_watch_cancels_polling() {
        let source = ScriptedSource::new(Vec::new());
        let poller = JobPoller::new(Arc::clone(&source), Duration::from_millis(2_000));
        let mut watch = poller.watch(Some("job-4"));
        assert!(watch.next().await.is_some());
        drop(watch);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.call_times().len(), 1);
    }

    /// Answers a single HTTP request with `status_line` and `body`, handing
    /// the raw request head back to the test.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::sync::oneshot::Receiver<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have address");
        let (head_tx, head_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("client should connect");
            let mut request = Vec::new();
            let mut buffer = [0_u8; 1_024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream.read(&mut buffer).await.expect("request should read");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            let _ = head_tx.send(String::from_utf8_lossy(&request).into_owned());

            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });

        (format!("http://{addr}"), head_rx)
    }

    fn http_source(base_url: &str, auth_token: Option<&str>) -> HttpJobStatusSource {
        let config = crate::realtime::types::SyncConfigArgs {
            base_url: Some(base_url.to_string()),
            auth_token: auth_token.map(str::to_string),
            ..Default::default()
        }
        .normalize()
        .expect("config should be valid");
        let client = Client::builder()
            .no_proxy()
            .build()
            .expect("client should build");
        HttpJobStatusSource::new(client, &config)
    }

    #[tokio::test]
    async fn http_source_decodes_job_and_sends_bearer_token() {
        let (base_url, head) = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"id":"job-1","status":"running","progress":0.25,"progress_message":"scoring","result":null,"error":null}"#,
        )
        .await;
        let source = http_source(&base_url, Some("secret-token"));

        let job = source.fetch_job("job-1").await.expect("job should decode");
        assert_eq!(job.id, "job-1");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress_fraction(), 0.25);

        let head = head.await.expect("request head").to_ascii_lowercase();
        assert!(head.starts_with("get /api/jobs/job-1 http/1.1"));
        assert!(head.contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn http_source_omits_authorization_without_token() {
        let (base_url, head) =
            serve_once("HTTP/1.1 200 OK", r#"{"id":"job-2","status":"completed","progress":1}"#)
                .await;
        let source = http_source(&base_url, None);

        let job = source.fetch_job("job-2").await.expect("job should decode");
        assert_eq!(job.status, JobStatus::Completed);
        let head = head.await.expect("request head").to_ascii_lowercase();
        assert!(!head.contains("authorization:"));
    }

    #[tokio::test]
    async fn http_source_reports_non_success_status() {
        let (base_url, _head) =
            serve_once("HTTP/1.1 503 Service Unavailable", r#"{"detail":"busy"}"#).await;
        let source = http_source(&base_url, Some("secret-token"));

        let error = source.fetch_job("job-3").await.expect_err("503 should fail");
        match error {
            SyncError::UnexpectedStatus { status, endpoint } => {
                assert_eq!(status, 503);
                assert!(endpoint.ends_with("/api/jobs/job-3"));
            }
            other => panic!("expected UnexpectedStatus, got {other}"),
        }
    }

    #[tokio::test]
    async fn http_source_reports_undecodable_body() {
        let (base_url, _head) = serve_once("HTTP/1.1 200 OK", r#"{"id":"job-4"}"#).await;
        let source = http_source(&base_url, None);

        let error = source.fetch_job("job-4").await.expect_err("body should not decode");
        assert!(matches!(error, SyncError::Request(_)));
    }
}
