//! Capability seams between the scheduling logic and its host
//! environment. The production binding decides what a "page" or a
//! "composer" actually is; the core only ever talks through these.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::FireCommand;

/// Identifier of a host page context (a tab, in browser terms).
pub type PageId = u64;

/// What the host environment offers for locating and driving pages on
/// the target application.
#[async_trait]
pub trait PageHost: Send + Sync {
    /// Page contexts currently open on the target application.
    async fn query_pages(&self) -> Result<Vec<PageId>>;

    /// Open a new background page. Resolves at navigation-complete,
    /// which is *not* the same as the page being ready to deliver —
    /// readiness is a separate signal from the page's delivery agent.
    async fn open_page(&self) -> Result<PageId>;

    /// Close a page context previously returned by this host.
    async fn close_page(&self, page: PageId) -> Result<()>;

    /// Hand a fire command to the page's delivery agent. Fire-and-forget:
    /// the outcome arrives separately as a delivery report.
    async fn dispatch_fire(&self, page: PageId, cmd: FireCommand) -> Result<()>;
}

/// Opaque handle to a resolved conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHandle {
    /// Stable key of the conversation within the host surface.
    pub key: String,
    /// Display title, used for activation checks and diagnostics.
    pub title: String,
}

/// Boundary around all selector-level brittleness: finding a
/// conversation and pushing text through its composer.
#[async_trait]
pub trait ConversationLocator: Send + Sync {
    /// Resolve the delivery target. `None` label means the currently
    /// active conversation; `key` disambiguates duplicate labels.
    /// Resolving a labeled target also begins opening it.
    async fn resolve_target(
        &self,
        label: Option<&str>,
        key: Option<&str>,
    ) -> Result<ConversationHandle>;

    /// Whether the conversation is frontmost with a usable composer.
    async fn is_active(&self, handle: &ConversationHandle) -> bool;

    /// Insert `text` into the composer and trigger submission.
    async fn deliver(&self, handle: &ConversationHandle, text: &str) -> Result<()>;
}
