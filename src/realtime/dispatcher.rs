use crate::realtime::invalidation::CacheInvalidator;
use crate::realtime::notifications::NotificationSink;
use crate::realtime::store::EventStateStore;
use crate::realtime::types::{
    DispatchOutcome, EventEnvelope, EventKind, Notification, NotificationLevel, ServerEvent,
};
use crate::realtime::{
    NEWS_ARTICLES_GROUP, NEWS_SENTIMENT_GROUP, ORDERS_GROUP, RECENT_JOBS_GROUP,
    REGIME_OVERVIEW_GROUP, RISK_ALERTS_GROUP, RISK_STATUS_GROUP, SCHEDULER_TASKS_GROUP,
    SENTIMENT_SIGNAL_GROUP,
};
use std::sync::Arc;

/// Cache groups refreshed by each event kind.
pub fn invalidation_groups(kind: EventKind) -> &'static [&'static str] {
    match kind {
        EventKind::HaltStatus => &[RISK_STATUS_GROUP],
        EventKind::OrderUpdate => &[ORDERS_GROUP],
        EventKind::RiskAlert => &[RISK_ALERTS_GROUP],
        EventKind::NewsUpdate => &[NEWS_ARTICLES_GROUP],
        EventKind::SentimentUpdate => &[NEWS_SENTIMENT_GROUP, SENTIMENT_SIGNAL_GROUP],
        EventKind::SchedulerEvent => &[RECENT_JOBS_GROUP, SCHEDULER_TASKS_GROUP],
        EventKind::RegimeChange => &[REGIME_OVERVIEW_GROUP],
    }
}

pub fn notification_for(event: &ServerEvent) -> Option<Notification> {
    match event {
        ServerEvent::HaltStatus(_) | ServerEvent::SentimentUpdate(_) => None,
        ServerEvent::OrderUpdate(order) => Some(Notification::new(
            NotificationLevel::Info,
            format!("Order {}: {}", order.symbol, order.status),
        )),
        ServerEvent::RiskAlert(alert) => {
            let message = if alert.message.trim().is_empty() {
                alert
                    .alert_type
                    .as_deref()
                    .map(|alert_type| format!("Risk alert: {alert_type}"))
                    .unwrap_or_else(|| "Risk alert".to_string())
            } else {
                alert.message.clone()
            };
            Some(Notification::new(NotificationLevel::Error, message))
        }
        ServerEvent::NewsUpdate(news) if news.articles_fetched > 0 => Some(Notification::new(
            NotificationLevel::Info,
            format!("Fetched {} new articles", news.articles_fetched),
        )),
        ServerEvent::NewsUpdate(_) => None,
        ServerEvent::SchedulerEvent(event) => {
            match event.status.to_ascii_lowercase().as_str() {
                "completed" => Some(Notification::new(
                    NotificationLevel::Success,
                    format!("{} completed", event.job_name),
                )),
                "failed" => {
                    let message = match event.message.as_deref() {
                        Some(detail) if !detail.is_empty() => {
                            format!("{} failed: {detail}", event.job_name)
                        }
                        _ => format!("{} failed", event.job_name),
                    };
                    Some(Notification::new(NotificationLevel::Error, message))
                }
                _ => None,
            }
        }
        ServerEvent::RegimeChange(regime) => Some(Notification::new(
            NotificationLevel::Warning,
            format!(
                "Regime change: {} → {}",
                regime.previous_regime.as_deref().unwrap_or("unknown"),
                regime.new_regime
            ),
        )),
    }
}

/// Routes decoded server events into the state store, the cache bridge and
/// the notification sink.
pub struct EventDispatcher {
    store: Arc<EventStateStore>,
    invalidator: Arc<dyn CacheInvalidator>,
    notifier: Arc<dyn NotificationSink>,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<EventStateStore>,
        invalidator: Arc<dyn CacheInvalidator>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            invalidator,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<EventStateStore> {
        &self.store
    }

    /// Decodes a raw frame and dispatches it. Undecodable frames and unknown
    /// tags return `None` and touch nothing.
    pub fn dispatch_frame(&self, payload: &mut [u8]) -> Option<DispatchOutcome> {
        match simd_json::serde::from_slice::<EventEnvelope>(payload) {
            Ok(envelope) => self.dispatch_envelope(envelope),
            Err(error) => {
                tracing::debug!(error = %error, "dropping undecodable event frame");
                None
            }
        }
    }

    /// Routes by the `type` tag first. A recognized tag whose `data` cannot
    /// be read still invalidates its cache groups; the store and notification
    /// sink are left alone because there is no payload to apply.
    pub fn dispatch_envelope(&self, envelope: EventEnvelope) -> Option<DispatchOutcome> {
        let kind = match envelope.kind() {
            Ok(kind) => kind,
            Err(error) => {
                tracing::debug!(error = %error, "ignoring event envelope");
                return None;
            }
        };

        match ServerEvent::from_payload(kind, envelope.data) {
            Ok(event) => Some(self.dispatch(&event)),
            Err(error) => {
                tracing::debug!(
                    event = kind.as_str(),
                    error = %error,
                    "unreadable event payload, refreshing caches only"
                );
                Some(self.invalidate_kind(kind))
            }
        }
    }

    fn invalidate_kind(&self, kind: EventKind) -> DispatchOutcome {
        let invalidated = invalidation_groups(kind);
        for group in invalidated {
            self.invalidator.invalidate(group);
        }
        DispatchOutcome {
            kind,
            invalidated,
            notification: None,
        }
    }

    pub fn dispatch(&self, event: &ServerEvent) -> DispatchOutcome {
        match event {
            ServerEvent::HaltStatus(halt) => self.store.apply_halt_status(halt),
            ServerEvent::OrderUpdate(order) => self.store.apply_order_update(order),
            ServerEvent::RiskAlert(alert) => self.store.apply_risk_alert(alert),
            ServerEvent::SchedulerEvent(scheduler) => self.store.apply_scheduler_event(scheduler),
            ServerEvent::RegimeChange(regime) => self.store.apply_regime_change(regime),
            ServerEvent::NewsUpdate(_) | ServerEvent::SentimentUpdate(_) => {}
        }

        let outcome = self.invalidate_kind(event.kind());

        let notification = notification_for(event);
        if let Some(notification) = notification.clone() {
            self.notifier.notify(notification);
        }

        tracing::debug!(
            event = outcome.kind.as_str(),
            groups = ?outcome.invalidated,
            "dispatched server event"
        );

        DispatchOutcome {
            notification,
            ..outcome
        }
    }
}
