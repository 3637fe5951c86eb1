//! In-memory chat surface — the simulated `ConversationLocator`.
//!
//! Full locator behavior with no DOM behind it: a conversation list, a
//! frontmost conversation, activation latency, and the failure modes a
//! real composer binding exhibits. The CLI's serve wiring and the test
//! suites both drive deliveries through it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use sendlater_core::error::{Result, SendLaterError};
use sendlater_core::traits::{ConversationHandle, ConversationLocator};
use sendlater_core::types::MAX_TEXT_CHARS;

/// One conversation row in the simulated surface.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub key: String,
    pub title: String,
}

#[derive(Default)]
struct ChatState {
    conversations: Vec<Conversation>,
    /// Key of the frontmost conversation, if any.
    active: Option<String>,
    /// Conversation opened but not yet frontmost, and when it will be.
    pending: Option<(String, Instant)>,
    delivered: Vec<(String, String)>,
    activation_delay: Duration,
    composer_broken: bool,
    /// Opened conversations never become frontmost.
    stuck: bool,
}

/// Simulated chat application surface.
#[derive(Default)]
pub struct SimulatedChat {
    state: Mutex<ChatState>,
}

impl SimulatedChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_conversation(&self, key: &str, title: &str) {
        self.state.lock().await.conversations.push(Conversation {
            key: key.into(),
            title: title.into(),
        });
    }

    /// Seed numbered conversations from a list of titles.
    pub async fn seed(&self, titles: &[String]) {
        let mut state = self.state.lock().await;
        for (i, title) in titles.iter().enumerate() {
            state.conversations.push(Conversation {
                key: format!("conv-{}", i + 1),
                title: title.clone(),
            });
        }
    }

    /// Bring a conversation to the front immediately.
    pub async fn activate(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.active = Some(key.into());
        state.pending = None;
    }

    /// Bring a conversation to the front by its title, if present.
    pub async fn activate_by_title(&self, title: &str) {
        let mut state = self.state.lock().await;
        if let Some(key) = state
            .conversations
            .iter()
            .find(|c| titles_match(title, &c.title))
            .map(|c| c.key.clone())
        {
            state.active = Some(key);
            state.pending = None;
        }
    }

    /// How long an opened conversation takes to become frontmost.
    pub async fn set_activation_delay(&self, delay: Duration) {
        self.state.lock().await.activation_delay = delay;
    }

    /// When set, `deliver` fails as if the composer was missing.
    pub async fn break_composer(&self, broken: bool) {
        self.state.lock().await.composer_broken = broken;
    }

    /// When set, opened conversations never become frontmost.
    pub async fn set_stuck(&self, stuck: bool) {
        self.state.lock().await.stuck = stuck;
    }

    /// Every delivered `(conversation key, text)` pair, in order.
    pub async fn delivered(&self) -> Vec<(String, String)> {
        self.state.lock().await.delivered.clone()
    }
}

/// Whitespace-collapsed, case-folded title comparison with prefix
/// tolerance — titles in chat lists often carry decorations.
fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn titles_match(target: &str, candidate: &str) -> bool {
    let (t, c) = (normalize(target), normalize(candidate));
    if t.is_empty() || c.is_empty() {
        return false;
    }
    t == c || c.starts_with(&t) || t.starts_with(&c)
}

#[async_trait]
impl ConversationLocator for SimulatedChat {
    async fn resolve_target(
        &self,
        label: Option<&str>,
        key: Option<&str>,
    ) -> Result<ConversationHandle> {
        let mut state = self.state.lock().await;

        let Some(label) = label else {
            // Active conversation at fire time.
            let active = state.active.clone().ok_or_else(|| {
                SendLaterError::Delivery("no active conversation to deliver into".into())
            })?;
            let conv = state
                .conversations
                .iter()
                .find(|c| c.key == active)
                .ok_or_else(|| {
                    SendLaterError::Delivery("active conversation disappeared".into())
                })?;
            return Ok(ConversationHandle {
                key: conv.key.clone(),
                title: conv.title.clone(),
            });
        };

        let matches: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| titles_match(label, &c.title))
            .cloned()
            .collect();
        let conv = match (matches.len(), key) {
            (0, _) => {
                return Err(SendLaterError::Delivery(format!(
                    "no conversation matching \"{label}\""
                )));
            }
            // Ambiguous label: the secondary key picks the row.
            (_, Some(key)) if matches.len() > 1 => matches
                .iter()
                .find(|c| c.key == key)
                .cloned()
                .ok_or_else(|| {
                    SendLaterError::Delivery(format!(
                        "several conversations match \"{label}\" and none has key \"{key}\""
                    ))
                })?,
            _ => matches[0].clone(),
        };

        // Opening the row; it becomes frontmost after the activation
        // delay unless the surface is stuck.
        if !state.stuck {
            let ready_at = Instant::now() + state.activation_delay;
            state.pending = Some((conv.key.clone(), ready_at));
        }
        Ok(ConversationHandle {
            key: conv.key,
            title: conv.title,
        })
    }

    async fn is_active(&self, handle: &ConversationHandle) -> bool {
        let mut state = self.state.lock().await;
        if state.active.as_deref() == Some(handle.key.as_str()) {
            return true;
        }
        if let Some((key, ready_at)) = state.pending.clone()
            && key == handle.key
            && Instant::now() >= ready_at
        {
            state.active = Some(key);
            state.pending = None;
            return true;
        }
        false
    }

    async fn deliver(&self, handle: &ConversationHandle, text: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.composer_broken {
            return Err(SendLaterError::Delivery(
                "message composer not found".into(),
            ));
        }
        let n = text.chars().count();
        if n > MAX_TEXT_CHARS {
            return Err(SendLaterError::Delivery(format!(
                "message too long ({n}/{MAX_TEXT_CHARS} characters)"
            )));
        }
        state.delivered.push((handle.key.clone(), text.into()));
        Ok(())
    }
}
