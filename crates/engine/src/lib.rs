//! Task delivery pipeline: state machine, idempotent claiming, dispatch
//! queue, retry policy and recovery sweeps.

pub mod error;
pub mod machine;
pub mod memory;
pub mod queue;
pub mod queue_redis;
pub mod retry;
pub mod service;
pub mod store;
pub mod store_postgres;
pub mod sweeper;

pub use error::DeliveryError;
pub use machine::{SendOutcome, Transition};
pub use queue::{DispatchEntry, DispatchQueue};
pub use retry::RetryPolicy;
pub use store::{Claim, ClaimOutcome, DeleteOutcome, RescheduleOutcome, TaskStore};
