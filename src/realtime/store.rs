use crate::realtime::types::{
    ConnectionStatusSnapshot, HaltStatus, OrderUpdate, RegimeChange, RiskAlert, SchedulerEvent,
    EVENTS_ENDPOINT_NAME,
};
use parking_lot::RwLock;
use serde::Serialize;

/// Latest value seen per event category. `None` means nothing has arrived yet.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventStateSnapshot {
    pub connection: ConnectionStatusSnapshot,
    pub is_halted: Option<bool>,
    pub halt_reason: Option<String>,
    pub last_order_update: Option<OrderUpdate>,
    pub last_risk_alert: Option<RiskAlert>,
    pub last_regime_change: Option<RegimeChange>,
    pub last_scheduler_event: Option<SchedulerEvent>,
}

impl EventStateSnapshot {
    fn empty(url: String) -> Self {
        Self {
            connection: ConnectionStatusSnapshot::closed(
                EVENTS_ENDPOINT_NAME.to_string(),
                url,
                Some("sync idle".to_string()),
            ),
            is_halted: None,
            halt_reason: None,
            last_order_update: None,
            last_risk_alert: None,
            last_regime_change: None,
            last_scheduler_event: None,
        }
    }
}

#[derive(Debug)]
pub struct EventStateStore {
    state: RwLock<EventStateSnapshot>,
}

impl EventStateStore {
    pub fn new(events_url: String) -> Self {
        Self {
            state: RwLock::new(EventStateSnapshot::empty(events_url)),
        }
    }

    pub fn snapshot(&self) -> EventStateSnapshot {
        self.state.read().clone()
    }

    pub fn connection(&self) -> ConnectionStatusSnapshot {
        self.state.read().connection.clone()
    }

    pub fn is_halted(&self) -> Option<bool> {
        self.state.read().is_halted
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.state.read().halt_reason.clone()
    }

    pub fn last_order_update(&self) -> Option<OrderUpdate> {
        self.state.read().last_order_update.clone()
    }

    pub fn last_risk_alert(&self) -> Option<RiskAlert> {
        self.state.read().last_risk_alert.clone()
    }

    pub fn last_regime_change(&self) -> Option<RegimeChange> {
        self.state.read().last_regime_change.clone()
    }

    pub fn last_scheduler_event(&self) -> Option<SchedulerEvent> {
        self.state.read().last_scheduler_event.clone()
    }

    pub(crate) fn set_connection(&self, status: ConnectionStatusSnapshot) {
        self.state.write().connection = status;
    }

    pub(crate) fn apply_halt_status(&self, halt: &HaltStatus) {
        let mut writable = self.state.write();
        writable.is_halted = Some(halt.is_halted);
        writable.halt_reason = halt.halt_reason.clone();
    }

    pub(crate) fn apply_order_update(&self, order: &OrderUpdate) {
        self.state.write().last_order_update = Some(order.clone());
    }

    pub(crate) fn apply_risk_alert(&self, alert: &RiskAlert) {
        self.state.write().last_risk_alert = Some(alert.clone());
    }

    pub(crate) fn apply_regime_change(&self, regime: &RegimeChange) {
        self.state.write().last_regime_change = Some(regime.clone());
    }

    pub(crate) fn apply_scheduler_event(&self, event: &SchedulerEvent) {
        self.state.write().last_scheduler_event = Some(event.clone());
    }
}
