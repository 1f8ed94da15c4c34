#[tokio::main]
async fn main() {
    realtime_sync_lib::telemetry::init_tracing();

    if let Err(error) = realtime_sync_lib::run().await {
        tracing::error!(error = %error, "realtime sync failed");
        std::process::exit(1);
    }
}
