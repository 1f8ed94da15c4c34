use crate::realtime::types::{Notification, NotificationLevel};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

pub const MAX_VISIBLE_NOTIFICATIONS: usize = 5;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEntry {
    pub id: u64,
    pub level: NotificationLevel,
    pub message: String,
}

#[derive(Debug, Default)]
struct NotificationQueue {
    next_id: u64,
    entries: VecDeque<NotificationEntry>,
}

/// Bounded toast queue. Holds at most [`MAX_VISIBLE_NOTIFICATIONS`] entries
/// and evicts the oldest one first.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    queue: Mutex<NotificationQueue>,
}

impl NotificationCenter {
    pub fn entries(&self) -> Vec<NotificationEntry> {
        self.queue.lock().entries.iter().cloned().collect()
    }

    pub fn dismiss(&self, id: u64) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.entries.len();
        queue.entries.retain(|entry| entry.id != id);
        queue.entries.len() != before
    }

    pub fn clear(&self) {
        self.queue.lock().entries.clear();
    }
}

impl NotificationSink for NotificationCenter {
    fn notify(&self, notification: Notification) {
        let mut queue = self.queue.lock();
        queue.next_id = queue.next_id.saturating_add(1);
        let id = queue.next_id;
        queue.entries.push_back(NotificationEntry {
            id,
            level: notification.level,
            message: notification.message,
        });
        while queue.entries.len() > MAX_VISIBLE_NOTIFICATIONS {
            queue.entries.pop_front();
        }
    }
}
