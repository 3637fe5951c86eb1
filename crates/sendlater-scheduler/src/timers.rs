//! Timer subsystem — one durable wake-up per scheduled message.
//!
//! Timers themselves are never persisted: the core re-derives them from
//! the record map at startup (see `engine::SchedulerCore::recover`).
//! Names are namespaced so the fire handler can share the host's alarm
//! space with other users; bare legacy ids written by older installs are
//! still honored.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::engine::CoreEvent;

/// Prefix for timer names owned by this crate.
pub const TIMER_PREFIX: &str = "sendlater-";

/// Namespaced timer name for a message id.
pub fn timer_name(id: &str) -> String {
    format!("{TIMER_PREFIX}{id}")
}

/// Message id behind a timer name. Accepts bare ids from versions that
/// did not namespace their alarms.
pub fn message_id(name: &str) -> &str {
    name.strip_prefix(TIMER_PREFIX).unwrap_or(name)
}

/// Wake-up-call capability: arm/cancel by name, fire-and-forget.
pub trait TimerDriver: Send + Sync {
    /// Arm (or re-arm) the named timer. Replaces any previous arm.
    fn arm(&self, name: &str, at: DateTime<Utc>);
    /// Cancel the named timer if armed.
    fn cancel(&self, name: &str);
}

/// Production driver: one spawned sleep task per armed timer, aborted
/// on cancel. Fires by pushing a `TimerFired` event into the core queue.
pub struct TokioTimers {
    events: UnboundedSender<CoreEvent>,
    armed: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTimers {
    pub fn new(events: UnboundedSender<CoreEvent>) -> Self {
        Self {
            events,
            armed: Mutex::new(HashMap::new()),
        }
    }
}

impl TimerDriver for TokioTimers {
    fn arm(&self, name: &str, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let events = self.events.clone();
        let fired = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(CoreEvent::TimerFired { name: fired });
        });
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = armed.insert(name.to_string(), handle) {
            old.abort();
        }
    }

    fn cancel(&self, name: &str) {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = armed.remove(name) {
            handle.abort();
        }
    }
}

/// Recording driver that never fires on its own.
///
/// The one-shot CLI commands use it — state is persisted and the next
/// `serve` recovery pass re-arms — and tests use it to observe exactly
/// what was armed and cancelled.
#[derive(Default)]
pub struct ManualTimers {
    inner: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    current: HashMap<String, DateTime<Utc>>,
    arm_history: Vec<(String, DateTime<Utc>)>,
    cancelled: Vec<String>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest arm time of a still-armed timer.
    pub fn armed_at(&self, name: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.current.get(name).copied()
    }

    pub fn is_armed(&self, name: &str) -> bool {
        self.armed_at(name).is_some()
    }

    pub fn armed_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.current.len()
    }

    /// Every arm call in order, including re-arms.
    pub fn arm_history(&self) -> Vec<(String, DateTime<Utc>)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.arm_history.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cancelled.clone()
    }
}

impl TimerDriver for ManualTimers {
    fn arm(&self, name: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.current.insert(name.to_string(), at);
        inner.arm_history.push((name.to_string(), at));
    }

    fn cancel(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.current.remove(name);
        inner.cancelled.push(name.to_string());
    }
}
