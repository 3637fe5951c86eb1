//! Page acquisition and the readiness handshake.
//!
//! Before a fire command can go anywhere, a page context on the target
//! application must exist, have finished navigating, and have explicitly
//! signalled that its interactive surface is usable — the host app keeps
//! initializing well past the load event, so readiness is its own
//! handshake. The broker runs that sequence with bounded waits; the
//! tracker keeps the ready set and the per-page waiter lists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};

use sendlater_core::config::PagesConfig;
use sendlater_core::error::{Result, SendLaterError};
use sendlater_core::traits::{PageHost, PageId};
use sendlater_core::types::FireCommand;

/// Ready pages plus whoever is waiting on pages that are not ready yet.
#[derive(Default)]
pub struct ReadyTracker {
    ready: HashSet<PageId>,
    waiters: HashMap<PageId, Vec<oneshot::Sender<Result<()>>>>,
}

impl ReadyTracker {
    /// Mark a page ready and resolve everyone waiting on it.
    pub fn mark_ready(&mut self, page: PageId) {
        self.ready.insert(page);
        for tx in self.waiters.remove(&page).unwrap_or_default() {
            let _ = tx.send(Ok(()));
        }
    }

    /// The page went away: drop it from the ready set and reject its
    /// waiters so no caller hangs.
    pub fn page_closed(&mut self, page: PageId) {
        self.ready.remove(&page);
        for tx in self.waiters.remove(&page).unwrap_or_default() {
            let _ = tx.send(Err(SendLaterError::Acquisition(format!(
                "page {page} closed before it became ready"
            ))));
        }
    }

    pub fn is_ready(&self, page: PageId) -> bool {
        self.ready.contains(&page)
    }

    /// `None` if the page is already ready, otherwise a receiver that
    /// resolves on readiness or rejection.
    fn subscribe(&mut self, page: PageId) -> Option<oneshot::Receiver<Result<()>>> {
        if self.ready.contains(&page) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(page).or_default().push(tx);
        Some(rx)
    }
}

/// What a successful acquisition hands back to the core.
#[derive(Debug, Clone, Copy)]
pub struct Dispatched {
    pub page: PageId,
    /// True when the page was opened solely for this delivery.
    pub fresh: bool,
}

/// Cloneable runner for the acquisition sequence of a fire.
#[derive(Clone)]
pub struct PageBroker {
    tracker: Arc<Mutex<ReadyTracker>>,
    host: Arc<dyn PageHost>,
    cfg: PagesConfig,
}

impl PageBroker {
    pub fn new(host: Arc<dyn PageHost>, cfg: PagesConfig) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(ReadyTracker::default())),
            host,
            cfg,
        }
    }

    pub async fn mark_ready(&self, page: PageId) {
        self.tracker.lock().await.mark_ready(page);
    }

    pub async fn page_closed(&self, page: PageId) {
        self.tracker.lock().await.page_closed(page);
    }

    pub async fn is_ready(&self, page: PageId) -> bool {
        self.tracker.lock().await.is_ready(page)
    }

    /// Bounded wait for a page's readiness signal.
    async fn wait_ready(&self, page: PageId) -> Result<()> {
        let rx = { self.tracker.lock().await.subscribe(page) };
        let Some(rx) = rx else {
            return Ok(());
        };
        match tokio::time::timeout(self.cfg.readiness_timeout(), rx).await {
            Err(_) => Err(SendLaterError::Acquisition(format!(
                "timed out after {}s waiting for page {page} to become ready",
                self.cfg.readiness_timeout_secs
            ))),
            Ok(Err(_)) => Err(SendLaterError::Acquisition(format!(
                "readiness tracking for page {page} was dropped"
            ))),
            Ok(Ok(res)) => res,
        }
    }

    /// Find or create a page, wait for readiness, let the host app
    /// settle, then dispatch the fire command.
    pub async fn acquire_and_fire(&self, cmd: FireCommand) -> Result<Dispatched> {
        let pages = self.host.query_pages().await?;
        let (page, fresh) = match pages.first() {
            Some(page) => (*page, false),
            None => {
                let opened =
                    tokio::time::timeout(self.cfg.navigation_timeout(), self.host.open_page())
                        .await
                        .map_err(|_| {
                            SendLaterError::Acquisition(format!(
                                "timed out after {}s waiting for a new page to finish navigating",
                                self.cfg.navigation_timeout_secs
                            ))
                        })??;
                tracing::debug!("📄 Opened page {opened} for message {}", cmd.id);
                (opened, true)
            }
        };

        self.wait_ready(page).await?;

        // A freshly created page needs more time for the host app's own
        // setup than one that was already open.
        let settle = if fresh {
            self.cfg.settle_fresh()
        } else {
            self.cfg.settle_warm()
        };
        tokio::time::sleep(settle).await;

        self.host.dispatch_fire(page, cmd).await?;
        Ok(Dispatched { page, fresh })
    }
}
