//! Delivery side of the pipeline.
//!
//! Workers consume the dispatch queue, claim tasks through the store's
//! conditional update, hand them to a `MessageSender` (Telegram in
//! production) and record the outcome:
//! - Retry with exponential backoff and jitter
//! - Delivery status tracking (pending → in_flight → delivered / failed)
//! - Stale-claim and lost-entry recovery via the engine's sweeper

pub mod sender;
pub mod worker;

pub use sender::{MessageSender, TelegramSender};
pub use worker::{DeliveryWorker, EntryOutcome, WorkerSettings};
