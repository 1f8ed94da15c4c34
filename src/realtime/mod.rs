pub mod connection;
pub mod dispatcher;
pub mod endpoints;
pub mod invalidation;
pub mod jobs;
pub mod notifications;
pub mod store;
pub mod tickers;
pub mod types;
pub mod wire;

pub const RISK_STATUS_GROUP: &str = "risk-status";
pub const ORDERS_GROUP: &str = "orders";
pub const RISK_ALERTS_GROUP: &str = "risk-alerts";
pub const NEWS_ARTICLES_GROUP: &str = "news-articles";
pub const NEWS_SENTIMENT_GROUP: &str = "news-sentiment";
pub const SENTIMENT_SIGNAL_GROUP: &str = "sentiment-signal";
pub const RECENT_JOBS_GROUP: &str = "recent-jobs";
pub const SCHEDULER_TASKS_GROUP: &str = "scheduler-tasks";
pub const REGIME_OVERVIEW_GROUP: &str = "regime-overview";
