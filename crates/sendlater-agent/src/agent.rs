//! Fire-command handling with the one-report contract.

use std::sync::Arc;

use sendlater_core::config::DeliveryConfig;
use sendlater_core::error::{Result, SendLaterError};
use sendlater_core::traits::{ConversationHandle, ConversationLocator, PageId};
use sendlater_core::types::{FireCommand, MAX_TEXT_CHARS};
use sendlater_scheduler::CoreHandle;

/// Per-page delivery agent.
pub struct DeliveryAgent {
    locator: Arc<dyn ConversationLocator>,
    core: CoreHandle,
    cfg: DeliveryConfig,
}

impl DeliveryAgent {
    pub fn new(
        locator: Arc<dyn ConversationLocator>,
        core: CoreHandle,
        cfg: DeliveryConfig,
    ) -> Self {
        Self { locator, core, cfg }
    }

    /// Announce that this page's interactive surface is usable. Distinct
    /// from navigation-complete: the host app keeps initializing its own
    /// components well past the load event.
    pub async fn announce_ready(&self, page: PageId) {
        let _ = self.core.page_ready(page).await;
    }

    /// Handle one fire command. Whatever happens inside, exactly one
    /// delivery report goes back to the core — the core must never be
    /// left waiting on a half-finished attempt.
    pub async fn handle_fire(&self, cmd: FireCommand) {
        let id = cmd.id.clone();
        match self.try_deliver(&cmd).await {
            Ok(()) => {
                tracing::info!("📤 Delivered message {id}");
                let _ = self.core.delivery_report(&id, true, None).await;
            }
            Err(e) => {
                tracing::warn!("Delivery failed for {id}: {e}");
                let _ = self
                    .core
                    .delivery_report(&id, false, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn try_deliver(&self, cmd: &FireCommand) -> Result<()> {
        // The bound holds at delivery time too, whatever was persisted.
        let n = cmd.text.chars().count();
        if n > MAX_TEXT_CHARS {
            return Err(SendLaterError::Delivery(format!(
                "message too long ({n}/{MAX_TEXT_CHARS} characters)"
            )));
        }

        let handle = self
            .locator
            .resolve_target(cmd.target_label.as_deref(), cmd.target_key.as_deref())
            .await?;

        // A labeled target was just opened; the active conversation
        // needs no activation wait.
        if cmd.target_label.is_some() {
            self.wait_for_active(&handle).await?;
        }

        self.locator.deliver(&handle, &cmd.text).await
    }

    /// Poll until the resolved conversation is frontmost. Bounded: fails
    /// past the attempt limit instead of hanging the core.
    async fn wait_for_active(&self, handle: &ConversationHandle) -> Result<()> {
        tokio::time::sleep(self.cfg.initial_delay()).await;
        for _ in 0..self.cfg.poll_attempts {
            if self.locator.is_active(handle).await {
                return Ok(());
            }
            tokio::time::sleep(self.cfg.poll_interval()).await;
        }
        Err(SendLaterError::Delivery(format!(
            "conversation \"{}\" never became active",
            handle.title
        )))
    }
}
