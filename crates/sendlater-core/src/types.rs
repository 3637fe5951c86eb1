//! Data model and wire protocol shared by the scheduler core and the
//! delivery agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SendLaterError};
use crate::traits::PageId;

/// Maximum message body length, in Unicode scalar values. Enforced at
/// schedule time, at edit time, and again at delivery time.
pub const MAX_TEXT_CHARS: usize = 4096;

/// Lifecycle of a scheduled message.
///
/// `scheduled → sending → {sent | failed}`; there is no way back to
/// `scheduled` once a timer has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    /// Terminal states accept no further transitions for this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Scheduled => write!(f, "scheduled"),
            MessageStatus::Sending => write!(f, "sending"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The sole persisted entity: one message queued for future delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    /// Unique id, stable for the record's lifetime.
    pub id: String,
    /// Message body (≤ [`MAX_TEXT_CHARS`]).
    pub text: String,
    /// Destination conversation; `None` = whatever is active at fire time.
    pub target_label: Option<String>,
    /// Secondary disambiguation token when the label is ambiguous.
    pub target_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Mutable only while `status == scheduled`.
    pub send_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Set once, on the transition into `sending`.
    pub fired_at: Option<DateTime<Utc>>,
    /// Set once, on the transition into a terminal state.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Last failure reason; cleared on successful delivery.
    pub last_error: Option<String>,
    /// Failed delivery attempts, for observability only.
    pub retries: u32,
}

impl ScheduledMessage {
    /// Fresh `scheduled` record with a generated id.
    pub fn new(
        text: String,
        send_at: DateTime<Utc>,
        target_label: Option<String>,
        target_key: Option<String>,
    ) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            text,
            target_label,
            target_key,
            created_at: Utc::now(),
            send_at,
            status: MessageStatus::Scheduled,
            fired_at: None,
            delivered_at: None,
            last_error: None,
            retries: 0,
        }
    }
}

/// Validate a message body the same way at every boundary.
pub fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(SendLaterError::Validation("message text is empty".into()));
    }
    let n = text.chars().count();
    if n > MAX_TEXT_CHARS {
        return Err(SendLaterError::Validation(format!(
            "message too long ({n}/{MAX_TEXT_CHARS} characters)"
        )));
    }
    Ok(())
}

/// Client → Scheduler Core requests. Wire tags match the original
/// cross-context protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    ScheduleMessage {
        text: String,
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_key: Option<String>,
    },
    GetMessages,
    DeliveryReport {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CancelMessage {
        id: String,
    },
    EditMessage {
        id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    PageReady {
        page_id: PageId,
    },
}

/// Scheduler Core → client responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    /// A new record exists and its timer is armed.
    Scheduled { id: String },
    /// The full record list.
    Messages { messages: Vec<ScheduledMessage> },
    /// Request handled, nothing to return.
    Ack,
    Error { error: String },
}

impl Response {
    pub fn err(error: impl Into<String>) -> Self {
        Response::Error {
            error: error.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, Response::Error { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Response::Error { error } => Some(error),
            _ => None,
        }
    }
}

impl From<SendLaterError> for Response {
    fn from(e: SendLaterError) -> Self {
        Response::err(e.to_string())
    }
}

/// Core → Agent fire command (`SEND_SCHEDULED`). Fire-and-forget: the
/// outcome comes back separately as a `DELIVERY_REPORT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireCommand {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,
}
