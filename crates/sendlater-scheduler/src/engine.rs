//! Scheduler Core — the single owner of durable scheduling state.
//!
//! One actor task holds the record map; everything that can mutate it
//! (protocol requests, timer fires, fire-task outcomes, page removals,
//! the retention sweep) arrives as an event on one queue, so transitions
//! for a given message are strictly ordered without locking the map.
//! Page acquisition runs in spawned tasks that report back through the
//! same queue and never touch state directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use sendlater_core::config::{PagesConfig, SchedulerConfig};
use sendlater_core::traits::{PageHost, PageId};
use sendlater_core::types::{
    FireCommand, MessageStatus, Request, Response, ScheduledMessage, validate_text,
};

use crate::pages::PageBroker;
use crate::store::MessageStore;
use crate::timers::{TimerDriver, message_id, timer_name};

/// Everything the core actor reacts to.
#[derive(Debug)]
pub enum CoreEvent {
    /// Protocol request with its reply slot.
    Request {
        req: Request,
        reply: oneshot::Sender<Response>,
    },
    /// A timer (by possibly-legacy name) went off.
    TimerFired { name: String },
    /// A spawned fire task handed its command to a page.
    FireDispatched { id: String, page: PageId, fresh: bool },
    /// A spawned fire task failed before dispatch.
    FireFailed { id: String, error: String },
    /// The host reports a page context is gone.
    PageRemoved { page: PageId },
    /// Retention sweep; replies with the number of records removed.
    Sweep {
        reply: Option<oneshot::Sender<usize>>,
    },
}

/// Cloneable handle for talking to a running core.
#[derive(Clone)]
pub struct CoreHandle {
    events: mpsc::UnboundedSender<CoreEvent>,
}

impl CoreHandle {
    /// Send a protocol request and wait for the reply.
    pub async fn request(&self, req: Request) -> Response {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(CoreEvent::Request { req, reply: tx })
            .is_err()
        {
            return Response::err("scheduler core is shut down");
        }
        rx.await
            .unwrap_or_else(|_| Response::err("scheduler core dropped the request"))
    }

    pub async fn schedule(
        &self,
        text: impl Into<String>,
        delay_ms: u64,
        target_label: Option<String>,
        target_key: Option<String>,
    ) -> Response {
        self.request(Request::ScheduleMessage {
            text: text.into(),
            delay_ms,
            target_label,
            target_key,
        })
        .await
    }

    /// Full record list, newest delivery time first.
    pub async fn messages(&self) -> Vec<ScheduledMessage> {
        match self.request(Request::GetMessages).await {
            Response::Messages { messages } => messages,
            _ => Vec::new(),
        }
    }

    pub async fn cancel(&self, id: &str) -> Response {
        self.request(Request::CancelMessage { id: id.into() }).await
    }

    pub async fn edit(&self, id: &str, text: impl Into<String>, delay_ms: Option<u64>) -> Response {
        self.request(Request::EditMessage {
            id: id.into(),
            text: text.into(),
            delay_ms,
        })
        .await
    }

    pub async fn delivery_report(&self, id: &str, ok: bool, error: Option<String>) -> Response {
        self.request(Request::DeliveryReport {
            id: id.into(),
            ok,
            error,
        })
        .await
    }

    pub async fn page_ready(&self, page_id: PageId) -> Response {
        self.request(Request::PageReady { page_id }).await
    }

    /// Notify the core that a page context disappeared.
    pub fn page_removed(&self, page: PageId) {
        let _ = self.events.send(CoreEvent::PageRemoved { page });
    }

    /// Kick a retention sweep without waiting for it.
    pub fn sweep(&self) {
        let _ = self.events.send(CoreEvent::Sweep { reply: None });
    }

    /// Run a retention sweep and return how many records were removed.
    pub async fn sweep_now(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(CoreEvent::Sweep { reply: Some(tx) })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Raw event sender, for wiring up timer drivers.
    pub fn sender(&self) -> mpsc::UnboundedSender<CoreEvent> {
        self.events.clone()
    }

    pub(crate) fn send(&self, ev: CoreEvent) {
        let _ = self.events.send(ev);
    }
}

/// The scheduler core actor. Build with [`SchedulerCore::channel`] +
/// [`SchedulerCore::new`], optionally [`recover`](Self::recover), then
/// spawn [`run`](Self::run).
pub struct SchedulerCore {
    messages: HashMap<String, ScheduledMessage>,
    store: MessageStore,
    timers: Arc<dyn TimerDriver>,
    host: Arc<dyn PageHost>,
    broker: PageBroker,
    cfg: SchedulerConfig,
    pages_cfg: PagesConfig,
    handle: CoreHandle,
    events: mpsc::UnboundedReceiver<CoreEvent>,
    /// Pages opened solely for one in-flight delivery, keyed by message
    /// id, awaiting closure after a successful report.
    ephemeral: HashMap<String, PageId>,
}

impl SchedulerCore {
    /// Create the event queue first so timer drivers and hosts can hold
    /// the sender before the core exists.
    pub fn channel() -> (CoreHandle, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CoreHandle { events: tx }, rx)
    }

    pub fn new(
        handle: CoreHandle,
        events: mpsc::UnboundedReceiver<CoreEvent>,
        store: MessageStore,
        timers: Arc<dyn TimerDriver>,
        host: Arc<dyn PageHost>,
        cfg: SchedulerConfig,
        pages_cfg: PagesConfig,
    ) -> Self {
        let messages = store.load();
        tracing::info!("📥 Loaded {} messages", messages.len());
        let broker = PageBroker::new(Arc::clone(&host), pages_cfg.clone());
        Self {
            messages,
            store,
            timers,
            host,
            broker,
            cfg,
            pages_cfg,
            handle,
            events,
            ephemeral: HashMap::new(),
        }
    }

    /// Re-derive timers from persisted records after a restart. Past-due
    /// messages are re-armed a short grace into the future instead of
    /// firing immediately, so a restart never produces a delivery burst.
    pub fn recover(&self) {
        let now = Utc::now();
        let mut armed = 0;
        for msg in self.messages.values() {
            match msg.status {
                MessageStatus::Scheduled => {
                    let at = if msg.send_at <= now {
                        now + self.cfg.grace()
                    } else {
                        msg.send_at
                    };
                    self.timers.arm(&timer_name(&msg.id), at);
                    armed += 1;
                }
                MessageStatus::Sending => {
                    tracing::warn!(
                        "Message {} was mid-delivery at shutdown; its outcome is unknown",
                        msg.id
                    );
                }
                _ => {}
            }
        }
        if armed > 0 {
            tracing::info!("⏰ Re-armed {armed} timers");
        }
    }

    /// Process events until every handle is gone.
    pub async fn run(mut self) {
        while let Some(ev) = self.events.recv().await {
            self.handle_event(ev).await;
        }
        tracing::debug!("scheduler core loop ended");
    }

    async fn handle_event(&mut self, ev: CoreEvent) {
        match ev {
            CoreEvent::Request { req, reply } => {
                let resp = self.handle_request(req).await;
                let _ = reply.send(resp);
            }
            CoreEvent::TimerFired { name } => self.handle_timer_fired(&name),
            CoreEvent::FireDispatched { id, page, fresh } => {
                self.handle_fire_dispatched(id, page, fresh)
            }
            CoreEvent::FireFailed { id, error } => self.handle_fire_failed(&id, error),
            CoreEvent::PageRemoved { page } => {
                self.broker.page_closed(page).await;
                self.ephemeral.retain(|_, p| *p != page);
                tracing::debug!("Page {page} removed");
            }
            CoreEvent::Sweep { reply } => {
                let removed = self.sweep(Utc::now());
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
        }
    }

    async fn handle_request(&mut self, req: Request) -> Response {
        match req {
            Request::ScheduleMessage {
                text,
                delay_ms,
                target_label,
                target_key,
            } => self.schedule(text, delay_ms, target_label, target_key),
            Request::GetMessages => {
                let mut list: Vec<_> = self.messages.values().cloned().collect();
                list.sort_by(|a, b| b.send_at.cmp(&a.send_at));
                Response::Messages { messages: list }
            }
            Request::DeliveryReport { id, ok, error } => self.delivery_report(&id, ok, error),
            Request::CancelMessage { id } => self.cancel(&id),
            Request::EditMessage { id, text, delay_ms } => self.edit(&id, text, delay_ms),
            Request::PageReady { page_id } => {
                self.broker.mark_ready(page_id).await;
                tracing::debug!("Page {page_id} is ready");
                Response::Ack
            }
        }
    }

    fn schedule(
        &mut self,
        text: String,
        delay_ms: u64,
        target_label: Option<String>,
        target_key: Option<String>,
    ) -> Response {
        if let Err(e) = validate_text(&text) {
            return e.into();
        }
        if delay_ms == 0 {
            return Response::err("validation: delay must be a positive number of milliseconds");
        }

        let send_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        let msg = ScheduledMessage::new(text, send_at, target_label, target_key);
        let id = msg.id.clone();

        self.timers.arm(&timer_name(&id), send_at);
        self.messages.insert(id.clone(), msg);
        self.save();
        tracing::info!("📅 Scheduled {id} for {send_at}");
        Response::Scheduled { id }
    }

    fn cancel(&mut self, id: &str) -> Response {
        match self.messages.get(id) {
            None => Response::err(format!("state conflict: no message with id {id}")),
            Some(msg) if msg.status != MessageStatus::Scheduled => Response::err(format!(
                "state conflict: message {id} is {} and can no longer be cancelled",
                msg.status
            )),
            Some(_) => {
                self.timers.cancel(&timer_name(id));
                self.messages.remove(id);
                self.save();
                tracing::info!("🗑️ Cancelled {id}");
                Response::Ack
            }
        }
    }

    fn edit(&mut self, id: &str, text: String, delay_ms: Option<u64>) -> Response {
        // Validate everything before touching the record.
        if let Err(e) = validate_text(&text) {
            return e.into();
        }
        if delay_ms == Some(0) {
            return Response::err("validation: delay must be a positive number of milliseconds");
        }
        let Some(msg) = self.messages.get_mut(id) else {
            return Response::err(format!("state conflict: no message with id {id}"));
        };
        if msg.status != MessageStatus::Scheduled {
            return Response::err(format!(
                "state conflict: message {id} is {} and can no longer be edited",
                msg.status
            ));
        }

        msg.text = text;
        if let Some(delay_ms) = delay_ms {
            let send_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
            msg.send_at = send_at;
            let name = timer_name(id);
            self.timers.cancel(&name);
            self.timers.arm(&name, send_at);
        }
        self.save();
        tracing::info!("✏️ Edited {id}");
        Response::Ack
    }

    fn delivery_report(&mut self, id: &str, ok: bool, error: Option<String>) -> Response {
        let Some(msg) = self.messages.get_mut(id) else {
            tracing::warn!("Delivery report for unknown message {id}");
            return Response::Ack;
        };
        if msg.status != MessageStatus::Sending {
            tracing::warn!(
                "Ignoring delivery report for {id} in state {} — terminal states stay put",
                msg.status
            );
            return Response::Ack;
        }

        msg.delivered_at = Some(Utc::now());
        let page_to_close = if ok {
            msg.status = MessageStatus::Sent;
            msg.last_error = None;
            tracing::info!("✓ Delivered {id}");
            self.ephemeral.remove(id)
        } else {
            msg.status = MessageStatus::Failed;
            let reason = error.unwrap_or_else(|| "delivery failed".into());
            tracing::warn!("✗ Delivery failed for {id}: {reason}");
            msg.last_error = Some(reason);
            msg.retries += 1;
            // Leave a failed delivery's page open for inspection.
            self.ephemeral.remove(id);
            None
        };
        self.save();
        if let Some(page) = page_to_close {
            self.schedule_page_close(page);
        }
        Response::Ack
    }

    /// A fired timer only acts on a message still in `scheduled` —
    /// stale or duplicate fires are logged no-ops.
    fn handle_timer_fired(&mut self, name: &str) {
        let id = message_id(name).to_string();
        // Drop the spent handle so the driver's table stays tidy.
        self.timers.cancel(name);

        let Some(msg) = self.messages.get_mut(&id) else {
            tracing::warn!("⏱️ Timer fired for unknown message {id}");
            return;
        };
        if msg.status != MessageStatus::Scheduled {
            tracing::warn!("⏱️ Timer fired for {id} in state {}; ignoring", msg.status);
            return;
        }

        msg.status = MessageStatus::Sending;
        msg.fired_at = Some(Utc::now());
        let cmd = FireCommand {
            id: id.clone(),
            text: msg.text.clone(),
            target_label: msg.target_label.clone(),
            target_key: msg.target_key.clone(),
        };
        self.save();
        tracing::info!("⏱️ Fired {id}");

        let broker = self.broker.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match broker.acquire_and_fire(cmd).await {
                Ok(d) => handle.send(CoreEvent::FireDispatched {
                    id,
                    page: d.page,
                    fresh: d.fresh,
                }),
                Err(e) => handle.send(CoreEvent::FireFailed {
                    id,
                    error: e.to_string(),
                }),
            }
        });
    }

    fn handle_fire_dispatched(&mut self, id: String, page: PageId, fresh: bool) {
        tracing::debug!("Fire command for {id} dispatched to page {page}");
        if !fresh {
            return;
        }
        // The report can beat this event; if the message already went
        // terminal, close (or keep) the page now instead of tracking it.
        match self.messages.get(&id).map(|m| m.status) {
            Some(MessageStatus::Sent) => self.schedule_page_close(page),
            Some(MessageStatus::Failed) => {}
            _ => {
                self.ephemeral.insert(id, page);
            }
        }
    }

    fn handle_fire_failed(&mut self, id: &str, error: String) {
        let Some(msg) = self.messages.get_mut(id) else {
            tracing::warn!("Fire failure for unknown message {id}");
            return;
        };
        if msg.status != MessageStatus::Sending {
            tracing::warn!("Fire failure for {id} in state {}; ignoring", msg.status);
            return;
        }
        msg.status = MessageStatus::Failed;
        msg.delivered_at = Some(Utc::now());
        msg.last_error = Some(error.clone());
        msg.retries += 1;
        self.save();
        tracing::warn!("✗ Could not fire {id}: {error}");
    }

    /// Close an ephemeral page a little after its delivery, leaving the
    /// host app room for any final network flush.
    fn schedule_page_close(&self, page: PageId) {
        let host = Arc::clone(&self.host);
        let delay = self.pages_cfg.close_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = host.close_page(page).await {
                tracing::warn!("Failed to close page {page}: {e}");
            }
        });
    }

    /// Remove terminal records older than the retention window.
    /// `scheduled` records are kept no matter their age.
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.cfg.retention();
        let before = self.messages.len();
        self.messages.retain(|_, msg| {
            if !msg.status.is_terminal() {
                return true;
            }
            msg.delivered_at.unwrap_or(msg.created_at) >= cutoff
        });
        let removed = before - self.messages.len();
        if removed > 0 {
            self.save();
            tracing::info!("🧹 Swept {removed} old messages");
        }
        removed
    }

    /// Persist the whole map. The in-memory state stays authoritative if
    /// the write fails; the next successful write catches up.
    fn save(&self) {
        if let Err(e) = self.store.save(&self.messages) {
            tracing::warn!("⚠️ Failed to persist messages: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::{ManualTimers, TokioTimers};
    use async_trait::async_trait;
    use sendlater_core::error::{Result, SendLaterError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// Host with a fixed page set that records fire dispatches.
    struct FakeHost {
        pages: Vec<PageId>,
        fail_query: AtomicBool,
        dispatched: AsyncMutex<Vec<FireCommand>>,
        closed: AsyncMutex<Vec<PageId>>,
    }

    impl FakeHost {
        fn with_pages(pages: Vec<PageId>) -> Self {
            Self {
                pages,
                fail_query: AtomicBool::new(false),
                dispatched: AsyncMutex::new(Vec::new()),
                closed: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageHost for FakeHost {
        async fn query_pages(&self) -> Result<Vec<PageId>> {
            if self.fail_query.load(Ordering::SeqCst) {
                return Err(SendLaterError::Acquisition("page query failed".into()));
            }
            Ok(self.pages.clone())
        }
        async fn open_page(&self) -> Result<PageId> {
            Ok(99)
        }
        async fn close_page(&self, page: PageId) -> Result<()> {
            self.closed.lock().await.push(page);
            Ok(())
        }
        async fn dispatch_fire(&self, _page: PageId, cmd: FireCommand) -> Result<()> {
            self.dispatched.lock().await.push(cmd);
            Ok(())
        }
    }

    struct Rig {
        core: SchedulerCore,
        timers: Arc<ManualTimers>,
        #[allow(dead_code)]
        host: Arc<FakeHost>,
        dir: std::path::PathBuf,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    fn rig(name: &str) -> Rig {
        let dir = std::env::temp_dir().join(format!("sendlater-test-engine-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        let (handle, rx) = SchedulerCore::channel();
        let timers = Arc::new(ManualTimers::new());
        let host = Arc::new(FakeHost::with_pages(vec![7]));
        let core = SchedulerCore::new(
            handle,
            rx,
            MessageStore::new(&dir),
            timers.clone(),
            host.clone(),
            SchedulerConfig::default(),
            PagesConfig::default(),
        );
        Rig {
            core,
            timers,
            host,
            dir,
        }
    }

    async fn schedule_one(core: &mut SchedulerCore, text: &str, delay_ms: u64) -> String {
        match core
            .handle_request(Request::ScheduleMessage {
                text: text.into(),
                delay_ms,
                target_label: None,
                target_key: None,
            })
            .await
        {
            Response::Scheduled { id } => id,
            other => panic!("schedule failed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_schedule_persists_and_arms_timer() {
        let mut r = rig("schedule");
        let id = schedule_one(&mut r.core, "hi", 60_000).await;

        assert_eq!(r.core.messages[&id].status, MessageStatus::Scheduled);
        assert!(r.timers.is_armed(&timer_name(&id)));
        assert_eq!(
            r.timers.armed_at(&timer_name(&id)),
            Some(r.core.messages[&id].send_at)
        );

        // Persisted wholesale
        let reloaded = MessageStore::new(&r.dir).load();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_rejects_long_text() {
        let mut r = rig("long-text");
        let resp = r
            .core
            .handle_request(Request::ScheduleMessage {
                text: "x".repeat(4097),
                delay_ms: 1000,
                target_label: None,
                target_key: None,
            })
            .await;
        assert!(resp.error().unwrap().contains("too long"));
        assert!(r.core.messages.is_empty());
        assert_eq!(r.timers.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_schedule_rejects_zero_delay() {
        let mut r = rig("zero-delay");
        let resp = r
            .core
            .handle_request(Request::ScheduleMessage {
                text: "hi".into(),
                delay_ms: 0,
                target_label: None,
                target_key: None,
            })
            .await;
        assert!(!resp.is_ok());
        assert!(r.core.messages.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_clears_timer_and_record() {
        let mut r = rig("cancel");
        let id = schedule_one(&mut r.core, "hi", 60_000).await;

        let resp = r
            .core
            .handle_request(Request::CancelMessage { id: id.clone() })
            .await;
        assert!(resp.is_ok());
        assert!(r.core.messages.is_empty());
        assert!(!r.timers.is_armed(&timer_name(&id)));

        // The stale fire is a no-op: no record reappears, nothing panics.
        r.core.handle_timer_fired(&timer_name(&id));
        assert!(r.core.messages.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_terminal_fail() {
        let mut r = rig("cancel-conflict");
        let resp = r
            .core
            .handle_request(Request::CancelMessage {
                id: "msg-nope".into(),
            })
            .await;
        assert!(resp.error().unwrap().contains("state conflict"));

        let id = schedule_one(&mut r.core, "hi", 60_000).await;
        r.core.messages.get_mut(&id).unwrap().status = MessageStatus::Sent;
        let before = r.core.messages[&id].clone();

        let resp = r
            .core
            .handle_request(Request::CancelMessage { id: id.clone() })
            .await;
        assert!(resp.error().unwrap().contains("sent"));
        assert_eq!(r.core.messages[&id].status, before.status);
        assert_eq!(r.core.messages[&id].text, before.text);
    }

    #[tokio::test]
    async fn test_edit_text_only_keeps_timer() {
        let mut r = rig("edit-text");
        let id = schedule_one(&mut r.core, "hi", 60_000).await;
        let original_at = r.core.messages[&id].send_at;

        let resp = r
            .core
            .handle_request(Request::EditMessage {
                id: id.clone(),
                text: "hello there".into(),
                delay_ms: None,
            })
            .await;
        assert!(resp.is_ok());
        assert_eq!(r.core.messages[&id].text, "hello there");
        assert_eq!(r.core.messages[&id].send_at, original_at);
        // Armed once at schedule time, never re-armed.
        assert_eq!(r.timers.arm_history().len(), 1);
    }

    #[tokio::test]
    async fn test_edit_with_delay_rearms() {
        let mut r = rig("edit-delay");
        let id = schedule_one(&mut r.core, "hi", 60_000).await;

        let resp = r
            .core
            .handle_request(Request::EditMessage {
                id: id.clone(),
                text: "hi".into(),
                delay_ms: Some(120_000),
            })
            .await;
        assert!(resp.is_ok());
        let name = timer_name(&id);
        assert_eq!(r.timers.cancelled(), vec![name.clone()]);
        assert_eq!(r.timers.armed_at(&name), Some(r.core.messages[&id].send_at));
    }

    #[tokio::test]
    async fn test_edit_non_scheduled_leaves_record_untouched() {
        let mut r = rig("edit-conflict");
        let id = schedule_one(&mut r.core, "hi", 60_000).await;
        r.core.messages.get_mut(&id).unwrap().status = MessageStatus::Failed;
        let before = r.core.messages[&id].clone();

        let resp = r
            .core
            .handle_request(Request::EditMessage {
                id: id.clone(),
                text: "changed".into(),
                delay_ms: Some(1),
            })
            .await;
        assert!(resp.error().unwrap().contains("state conflict"));
        assert_eq!(r.core.messages[&id].text, before.text);
        assert_eq!(r.core.messages[&id].send_at, before.send_at);
    }

    #[tokio::test]
    async fn test_timer_fire_moves_to_sending_once() {
        let mut r = rig("fire");
        let id = schedule_one(&mut r.core, "hi", 1000).await;

        r.core.handle_timer_fired(&timer_name(&id));
        assert_eq!(r.core.messages[&id].status, MessageStatus::Sending);
        let fired_at = r.core.messages[&id].fired_at;
        assert!(fired_at.is_some());

        // A duplicate fire must not restart the sequence.
        r.core.handle_timer_fired(&timer_name(&id));
        assert_eq!(r.core.messages[&id].status, MessageStatus::Sending);
        assert_eq!(r.core.messages[&id].fired_at, fired_at);
    }

    #[tokio::test]
    async fn test_timer_fire_accepts_legacy_names() {
        let mut r = rig("fire-legacy");
        let id = schedule_one(&mut r.core, "hi", 1000).await;

        // Bare id, as written by a pre-namespacing install.
        r.core.handle_timer_fired(&id);
        assert_eq!(r.core.messages[&id].status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn test_timer_fire_unknown_is_noop() {
        let mut r = rig("fire-unknown");
        r.core.handle_timer_fired("sendlater-msg-ghost");
        assert!(r.core.messages.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_report_success() {
        let mut r = rig("report-ok");
        let id = schedule_one(&mut r.core, "hi", 1000).await;
        r.core.handle_timer_fired(&timer_name(&id));

        let resp = r
            .core
            .handle_request(Request::DeliveryReport {
                id: id.clone(),
                ok: true,
                error: None,
            })
            .await;
        assert!(resp.is_ok());
        let msg = &r.core.messages[&id];
        assert_eq!(msg.status, MessageStatus::Sent);
        assert!(msg.delivered_at.is_some());
        assert!(msg.last_error.is_none());
        assert_eq!(msg.retries, 0);
    }

    #[tokio::test]
    async fn test_delivery_report_failure() {
        let mut r = rig("report-fail");
        let id = schedule_one(&mut r.core, "hi", 1000).await;
        r.core.handle_timer_fired(&timer_name(&id));

        r.core
            .handle_request(Request::DeliveryReport {
                id: id.clone(),
                ok: false,
                error: Some("composer not found".into()),
            })
            .await;
        let msg = &r.core.messages[&id];
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.last_error.as_deref(), Some("composer not found"));
        assert_eq!(msg.retries, 1);
        assert!(msg.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_delivery_report_unknown_id_is_noop() {
        let mut r = rig("report-unknown");
        let resp = r
            .core
            .handle_request(Request::DeliveryReport {
                id: "msg-ghost".into(),
                ok: true,
                error: None,
            })
            .await;
        assert!(resp.is_ok());
        assert!(r.core.messages.is_empty());
    }

    #[tokio::test]
    async fn test_report_cannot_leave_terminal_state() {
        let mut r = rig("report-terminal");
        let id = schedule_one(&mut r.core, "hi", 1000).await;
        r.core.handle_timer_fired(&timer_name(&id));
        r.core
            .handle_request(Request::DeliveryReport {
                id: id.clone(),
                ok: true,
                error: None,
            })
            .await;

        // A late contradictory report is ignored.
        r.core
            .handle_request(Request::DeliveryReport {
                id: id.clone(),
                ok: false,
                error: Some("late failure".into()),
            })
            .await;
        assert_eq!(r.core.messages[&id].status, MessageStatus::Sent);
        assert!(r.core.messages[&id].last_error.is_none());
    }

    #[tokio::test]
    async fn test_fire_failed_event_marks_failed() {
        let mut r = rig("fire-failed");
        let id = schedule_one(&mut r.core, "hi", 1000).await;
        r.core.handle_timer_fired(&timer_name(&id));

        r.core
            .handle_fire_failed(&id, "acquisition: timed out after 30s".into());
        let msg = &r.core.messages[&id];
        assert_eq!(msg.status, MessageStatus::Failed);
        assert!(msg.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(msg.retries, 1);
    }

    #[tokio::test]
    async fn test_recovery_rearms_overdue_with_grace() {
        let dir = std::env::temp_dir().join("sendlater-test-engine-recovery");
        std::fs::remove_dir_all(&dir).ok();
        let store = MessageStore::new(&dir);

        let mut overdue = ScheduledMessage::new(
            "overdue".into(),
            Utc::now() - chrono::Duration::hours(2),
            None,
            None,
        );
        overdue.id = "msg-overdue".into();
        let mut future = ScheduledMessage::new(
            "future".into(),
            Utc::now() + chrono::Duration::hours(1),
            None,
            None,
        );
        future.id = "msg-future".into();
        let mut done = ScheduledMessage::new("done".into(), Utc::now(), None, None);
        done.id = "msg-done".into();
        done.status = MessageStatus::Sent;

        let mut map = HashMap::new();
        for m in [overdue, future.clone(), done] {
            map.insert(m.id.clone(), m);
        }
        store.save(&map).unwrap();

        // Simulated restart: a fresh core loads the blob and recovers.
        let (handle, rx) = SchedulerCore::channel();
        let timers = Arc::new(ManualTimers::new());
        let core = SchedulerCore::new(
            handle,
            rx,
            MessageStore::new(&dir),
            timers.clone(),
            Arc::new(FakeHost::with_pages(vec![])),
            SchedulerConfig::default(),
            PagesConfig::default(),
        );
        let before = Utc::now();
        core.recover();

        // Overdue: not dropped, not fired immediately — re-armed at
        // roughly now + grace.
        let at = timers.armed_at(&timer_name("msg-overdue")).unwrap();
        assert!(at > before);
        assert!(at >= before + chrono::Duration::seconds(4));
        assert!(at <= Utc::now() + chrono::Duration::seconds(6));

        // Future: armed exactly at its send time.
        assert_eq!(
            timers.armed_at(&timer_name("msg-future")),
            Some(future.send_at)
        );

        // Terminal records get no timer.
        assert!(!timers.is_armed(&timer_name("msg-done")));
        assert_eq!(timers.armed_count(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_sweep_removes_old_terminal_only() {
        let mut r = rig("sweep");
        let now = Utc::now();

        let mut old_sent = ScheduledMessage::new("a".into(), now, None, None);
        old_sent.id = "msg-old-sent".into();
        old_sent.status = MessageStatus::Sent;
        old_sent.delivered_at = Some(now - chrono::Duration::days(8));

        let mut old_scheduled = ScheduledMessage::new("b".into(), now, None, None);
        old_scheduled.id = "msg-old-sched".into();
        old_scheduled.created_at = now - chrono::Duration::days(8);

        let mut fresh_failed = ScheduledMessage::new("c".into(), now, None, None);
        fresh_failed.id = "msg-fresh-failed".into();
        fresh_failed.status = MessageStatus::Failed;
        fresh_failed.delivered_at = Some(now - chrono::Duration::days(2));

        for m in [old_sent, old_scheduled, fresh_failed] {
            r.core.messages.insert(m.id.clone(), m);
        }

        let removed = r.core.sweep(now);
        assert_eq!(removed, 1);
        assert!(!r.core.messages.contains_key("msg-old-sent"));
        assert!(r.core.messages.contains_key("msg-old-sched"));
        assert!(r.core.messages.contains_key("msg-fresh-failed"));
    }

    // ── Full actor round-trips ──

    fn fast_pages_cfg() -> PagesConfig {
        PagesConfig {
            readiness_timeout_secs: 1,
            settle_fresh_ms: 5,
            settle_warm_ms: 5,
            close_delay_secs: 0,
            ..PagesConfig::default()
        }
    }

    async fn wait_for_status(
        handle: &CoreHandle,
        id: &str,
        status: MessageStatus,
    ) -> ScheduledMessage {
        for _ in 0..100 {
            if let Some(msg) = handle.messages().await.into_iter().find(|m| m.id == id)
                && msg.status == status
            {
                return msg;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("message {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_end_to_end_success_through_actor() {
        let dir = std::env::temp_dir().join("sendlater-test-engine-e2e-ok");
        std::fs::remove_dir_all(&dir).ok();
        let (handle, rx) = SchedulerCore::channel();
        let timers = Arc::new(TokioTimers::new(handle.sender()));
        let host = Arc::new(FakeHost::with_pages(vec![7]));
        let core = SchedulerCore::new(
            handle.clone(),
            rx,
            MessageStore::new(&dir),
            timers,
            host.clone(),
            SchedulerConfig::default(),
            fast_pages_cfg(),
        );
        tokio::spawn(core.run());

        handle.page_ready(7).await;
        let id = match handle.schedule("hi", 50, None, None).await {
            Response::Scheduled { id } => id,
            other => panic!("schedule failed: {other:?}"),
        };

        // Timer fires, the fire task dispatches to page 7.
        wait_for_status(&handle, &id, MessageStatus::Sending).await;
        for _ in 0..100 {
            if !host.dispatched.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(host.dispatched.lock().await[0].id, id);

        // The agent reports success.
        handle.delivery_report(&id, true, None).await;
        let msg = wait_for_status(&handle, &id, MessageStatus::Sent).await;
        assert!(msg.delivered_at.is_some());
        assert!(msg.last_error.is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_end_to_end_readiness_timeout_fails_message() {
        let dir = std::env::temp_dir().join("sendlater-test-engine-e2e-timeout");
        std::fs::remove_dir_all(&dir).ok();
        let (handle, rx) = SchedulerCore::channel();
        let timers = Arc::new(TokioTimers::new(handle.sender()));
        // The page exists but never signals readiness.
        let host = Arc::new(FakeHost::with_pages(vec![7]));
        let core = SchedulerCore::new(
            handle.clone(),
            rx,
            MessageStore::new(&dir),
            timers,
            host,
            SchedulerConfig::default(),
            fast_pages_cfg(),
        );
        tokio::spawn(core.run());

        let id = match handle.schedule("hi", 50, Some("Alice".into()), None).await {
            Response::Scheduled { id } => id,
            other => panic!("schedule failed: {other:?}"),
        };

        let msg = wait_for_status(&handle, &id, MessageStatus::Failed).await;
        assert!(msg.last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(msg.retries, 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_end_to_end_page_query_failure_fails_message() {
        let dir = std::env::temp_dir().join("sendlater-test-engine-e2e-query");
        std::fs::remove_dir_all(&dir).ok();
        let (handle, rx) = SchedulerCore::channel();
        let timers = Arc::new(TokioTimers::new(handle.sender()));
        let host = Arc::new(FakeHost::with_pages(vec![7]));
        host.fail_query.store(true, Ordering::SeqCst);
        let core = SchedulerCore::new(
            handle.clone(),
            rx,
            MessageStore::new(&dir),
            timers,
            host,
            SchedulerConfig::default(),
            fast_pages_cfg(),
        );
        tokio::spawn(core.run());

        let id = match handle.schedule("hi", 50, None, None).await {
            Response::Scheduled { id } => id,
            other => panic!("schedule failed: {other:?}"),
        };

        let msg = wait_for_status(&handle, &id, MessageStatus::Failed).await;
        assert!(msg.last_error.as_deref().unwrap().contains("page query"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
