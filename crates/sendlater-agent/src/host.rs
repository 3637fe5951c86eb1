//! Simulated page host — page contexts, navigation, readiness, and one
//! delivery agent per page.
//!
//! Implements the `PageHost` capability the scheduler core consumes.
//! Opening a page "navigates" for a moment, then its agent announces
//! readiness through the core handle, exactly as a real page binding
//! would after the host app's UI finishes initializing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use sendlater_core::config::DeliveryConfig;
use sendlater_core::error::{Result, SendLaterError};
use sendlater_core::traits::{ConversationLocator, PageHost, PageId};
use sendlater_core::types::FireCommand;
use sendlater_scheduler::CoreHandle;

use crate::agent::DeliveryAgent;

/// Host-simulation latencies. Near-instant by default; stretched in
/// tests that exercise the bounded waits.
#[derive(Debug, Clone)]
pub struct HostTiming {
    /// Time a fresh page spends navigating.
    pub navigation: Duration,
    /// Time between navigation-complete and the readiness announcement.
    pub readiness: Duration,
}

impl Default for HostTiming {
    fn default() -> Self {
        Self {
            navigation: Duration::from_millis(150),
            readiness: Duration::from_millis(250),
        }
    }
}

/// Simulated `PageHost` over a shared chat surface.
pub struct SimulatedPageHost {
    core: CoreHandle,
    locator: Arc<dyn ConversationLocator>,
    delivery_cfg: DeliveryConfig,
    timing: HostTiming,
    url: String,
    /// Pages never announce readiness; acquisitions time out.
    mute_ready: bool,
    pages: Mutex<HashMap<PageId, Arc<DeliveryAgent>>>,
    next_page: AtomicU64,
}

impl SimulatedPageHost {
    pub fn new(
        core: CoreHandle,
        locator: Arc<dyn ConversationLocator>,
        delivery_cfg: DeliveryConfig,
    ) -> Self {
        Self {
            core,
            locator,
            delivery_cfg,
            timing: HostTiming::default(),
            url: "about:blank".into(),
            mute_ready: false,
            pages: Mutex::new(HashMap::new()),
            next_page: AtomicU64::new(0),
        }
    }

    /// Display URL for opened pages, matching the configured pattern.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_timing(mut self, timing: HostTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Never announce readiness — for exercising the handshake timeout.
    pub fn with_muted_readiness(mut self) -> Self {
        self.mute_ready = true;
        self
    }

    /// Open a page immediately, as if the user already had the app up.
    pub async fn preopen_page(&self) -> PageId {
        self.spawn_page().await
    }

    pub async fn page_count(&self) -> usize {
        self.pages.lock().await.len()
    }

    async fn spawn_page(&self) -> PageId {
        let id = self.next_page.fetch_add(1, Ordering::SeqCst) + 1;
        let agent = Arc::new(DeliveryAgent::new(
            Arc::clone(&self.locator),
            self.core.clone(),
            self.delivery_cfg.clone(),
        ));
        self.pages.lock().await.insert(id, Arc::clone(&agent));
        tracing::debug!("📄 Page {id} open on {}", self.url);

        if !self.mute_ready {
            let delay = self.timing.readiness;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                agent.announce_ready(id).await;
            });
        }
        id
    }
}

#[async_trait]
impl PageHost for SimulatedPageHost {
    async fn query_pages(&self) -> Result<Vec<PageId>> {
        let mut pages: Vec<PageId> = self.pages.lock().await.keys().copied().collect();
        pages.sort_unstable();
        Ok(pages)
    }

    async fn open_page(&self) -> Result<PageId> {
        tokio::time::sleep(self.timing.navigation).await;
        Ok(self.spawn_page().await)
    }

    async fn close_page(&self, page: PageId) -> Result<()> {
        let removed = self.pages.lock().await.remove(&page).is_some();
        if removed {
            tracing::debug!("Closed page {page}");
            self.core.page_removed(page);
        }
        Ok(())
    }

    async fn dispatch_fire(&self, page: PageId, cmd: FireCommand) -> Result<()> {
        let agent = self
            .pages
            .lock()
            .await
            .get(&page)
            .cloned()
            .ok_or_else(|| SendLaterError::Acquisition(format!("page {page} is gone")))?;
        tokio::spawn(async move {
            agent.handle_fire(cmd).await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedChat;
    use sendlater_core::config::{PagesConfig, SchedulerConfig};
    use sendlater_core::types::{MessageStatus, Response, ScheduledMessage};
    use sendlater_scheduler::{MessageStore, SchedulerCore, TokioTimers};

    fn fast_timing() -> HostTiming {
        HostTiming {
            navigation: Duration::from_millis(10),
            readiness: Duration::from_millis(10),
        }
    }

    fn fast_pages_cfg() -> PagesConfig {
        PagesConfig {
            readiness_timeout_secs: 1,
            settle_fresh_ms: 10,
            settle_warm_ms: 5,
            close_delay_secs: 0,
            ..PagesConfig::default()
        }
    }

    fn fast_delivery_cfg() -> DeliveryConfig {
        DeliveryConfig {
            initial_delay_ms: 5,
            poll_attempts: 12,
            poll_interval_ms: 5,
        }
    }

    struct Stack {
        handle: CoreHandle,
        host: Arc<SimulatedPageHost>,
        chat: Arc<SimulatedChat>,
        dir: std::path::PathBuf,
    }

    impl Drop for Stack {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    /// Full production wiring: real core actor, real tokio timers,
    /// simulated host over a simulated chat.
    async fn stack(name: &str, mute_ready: bool) -> Stack {
        let dir = std::env::temp_dir().join(format!("sendlater-test-host-{name}"));
        std::fs::remove_dir_all(&dir).ok();

        let (handle, rx) = SchedulerCore::channel();
        let timers = Arc::new(TokioTimers::new(handle.sender()));
        let chat = Arc::new(SimulatedChat::new());
        chat.add_conversation("conv-1", "Alice").await;
        chat.add_conversation("conv-2", "Bob").await;

        let mut host = SimulatedPageHost::new(handle.clone(), chat.clone(), fast_delivery_cfg())
            .with_timing(fast_timing());
        if mute_ready {
            host = host.with_muted_readiness();
        }
        let host = Arc::new(host);

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

        Stack {
            handle,
            host,
            chat,
            dir,
        }
    }

    async fn wait_for_status(
        handle: &CoreHandle,
        id: &str,
        status: MessageStatus,
    ) -> ScheduledMessage {
        for _ in 0..200 {
            if let Some(msg) = handle.messages().await.into_iter().find(|m| m.id == id)
                && msg.status == status
            {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("message {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_full_stack_delivery_to_active_conversation() {
        let s = stack("warm", false).await;
        s.chat.activate("conv-1").await;
        s.host.preopen_page().await;

        let id = match s.handle.schedule("hi there", 50, None, None).await {
            Response::Scheduled { id } => id,
            other => panic!("schedule failed: {other:?}"),
        };

        let msg = wait_for_status(&s.handle, &id, MessageStatus::Sent).await;
        assert!(msg.delivered_at.is_some());
        assert_eq!(
            s.chat.delivered().await,
            vec![("conv-1".into(), "hi there".into())]
        );
        // The page was already open, so it stays open.
        assert_eq!(s.host.page_count().await, 1);
    }

    #[tokio::test]
    async fn test_full_stack_fresh_page_is_closed_after_delivery() {
        let s = stack("fresh", false).await;

        let id = match s
            .handle
            .schedule("see you at 8", 50, Some("Bob".into()), None)
            .await
        {
            Response::Scheduled { id } => id,
            other => panic!("schedule failed: {other:?}"),
        };

        wait_for_status(&s.handle, &id, MessageStatus::Sent).await;
        assert_eq!(
            s.chat.delivered().await,
            vec![("conv-2".into(), "see you at 8".into())]
        );

        // The page existed only for this delivery; it goes away shortly
        // after the successful report.
        for _ in 0..100 {
            if s.host.page_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("ephemeral page was never closed");
    }

    #[tokio::test]
    async fn test_full_stack_readiness_timeout_fails_message() {
        let s = stack("mute", true).await;

        let id = match s.handle.schedule("hi", 50, Some("Alice".into()), None).await {
            Response::Scheduled { id } => id,
            other => panic!("schedule failed: {other:?}"),
        };

        let msg = wait_for_status(&s.handle, &id, MessageStatus::Failed).await;
        assert!(msg.last_error.as_deref().unwrap().contains("timed out"));
        assert!(s.chat.delivered().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_to_closed_page_errors() {
        let s = stack("gone", false).await;
        let page = s.host.preopen_page().await;
        s.host.close_page(page).await.unwrap();

        let err = s
            .host
            .dispatch_fire(
                page,
                FireCommand {
                    id: "msg-x".into(),
                    text: "hi".into(),
                    target_label: None,
                    target_key: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gone"));
    }
}
