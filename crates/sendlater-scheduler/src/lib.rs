//! # SendLater Scheduler
//!
//! The Scheduler Core: the single owner of durable scheduling state,
//! the per-message timer subsystem with restart recovery, and the page
//! acquisition / readiness handshake that precedes every delivery.
//!
//! ## Architecture
//! ```text
//! CoreHandle (requests + oneshot replies)
//!   └── SchedulerCore actor (one event queue, one writer)
//!         ├── MessageStore — whole-map JSON blob, written on every mutation
//!         ├── TimerDriver  — one wake-up per scheduled message
//!         ├── PageBroker   — find/open page → readiness wait → settle → fire
//!         └── retention sweep — terminal records expire after 7 days
//! ```

pub mod engine;
pub mod pages;
pub mod store;
pub mod timers;

pub use engine::{CoreEvent, CoreHandle, SchedulerCore};
pub use pages::{Dispatched, PageBroker, ReadyTracker};
pub use store::MessageStore;
pub use timers::{ManualTimers, TIMER_PREFIX, TimerDriver, TokioTimers, message_id, timer_name};
