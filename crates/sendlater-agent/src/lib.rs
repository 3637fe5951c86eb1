//! # SendLater Delivery Agent
//!
//! Page-side half of the pipeline: receives fire commands, resolves the
//! target conversation behind the [`ConversationLocator`] seam, pushes
//! the text through the composer, and always reports exactly one outcome
//! back to the scheduler core — also when something goes wrong halfway.
//!
//! Ships simulated adapters (an in-memory chat surface and a page host
//! driving one agent per page) that plug in where a real browser binding
//! would, the same way channel stubs stand in for live APIs elsewhere.
//!
//! [`ConversationLocator`]: sendlater_core::traits::ConversationLocator

pub mod agent;
pub mod host;
pub mod sim;

pub use agent::DeliveryAgent;
pub use host::{HostTiming, SimulatedPageHost};
pub use sim::{Conversation, SimulatedChat};
