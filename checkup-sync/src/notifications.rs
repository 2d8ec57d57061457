//! Transient user notifications
//!
//! Station-local messages (save confirmations, validation failures,
//! backend rejections). Regular notifications hide themselves after a fixed
//! delay; persistent ones stay until dismissed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const DEFAULT_AUTO_HIDE: Duration = Duration::from_millis(3000);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Error,
    #[default]
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub message: String,
    pub severity: Severity,
    /// `None` for persistent notifications
    pub auto_hide: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Shown(Notification),
    Hidden(u64),
}

struct Inner {
    next_id: AtomicU64,
    active: Mutex<BTreeMap<u64, Notification>>,
    events: broadcast::Sender<NotificationEvent>,
    auto_hide: Duration,
}

/// Shared notification queue; clones refer to the same queue
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<Inner>,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_HIDE)
    }
}

impl NotificationCenter {
    pub fn new(auto_hide: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                active: Mutex::new(BTreeMap::new()),
                events,
                auto_hide,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.inner.events.subscribe()
    }

    /// Show a notification that hides itself after the auto-hide delay
    pub fn show(&self, message: impl Into<String>, severity: Severity) -> u64 {
        let id = self.push(message.into(), severity, Some(self.inner.auto_hide));

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let center = self.clone();
                let delay = self.inner.auto_hide;
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    center.dismiss(id);
                });
            }
            Err(_) => tracing::debug!(id, "No runtime, notification will not auto-hide"),
        }
        id
    }

    /// Show a notification that stays until [`NotificationCenter::dismiss`]
    pub fn show_persistent(&self, message: impl Into<String>, severity: Severity) -> u64 {
        self.push(message.into(), severity, None)
    }

    pub fn success(&self, message: impl Into<String>) -> u64 {
        self.show(message, Severity::Success)
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.show(message, Severity::Error)
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.show(message, Severity::Info)
    }

    pub fn warning(&self, message: impl Into<String>) -> u64 {
        self.show(message, Severity::Warning)
    }

    /// Hide a notification; false if it was already gone
    pub fn dismiss(&self, id: u64) -> bool {
        let removed = self.inner.active.lock().remove(&id).is_some();
        if removed {
            let _ = self.inner.events.send(NotificationEvent::Hidden(id));
        }
        removed
    }

    /// Currently visible notifications, oldest first
    pub fn active(&self) -> Vec<Notification> {
        self.inner.active.lock().values().cloned().collect()
    }

    fn push(&self, message: String, severity: Severity, auto_hide: Option<Duration>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let notification = Notification {
            id,
            message,
            severity,
            auto_hide,
        };

        match severity {
            Severity::Error => tracing::warn!(id, message = %notification.message, "Notification"),
            _ => tracing::debug!(id, message = %notification.message, "Notification"),
        }

        self.inner.active.lock().insert(id, notification.clone());
        let _ = self.inner.events.send(NotificationEvent::Shown(notification));
        id
    }
}
