//! Brokerage-facing order handling.
//!
//! - [`OrderManager`]: the order table and per-instrument positions
//! - [`retry`]: bounded retries for broker calls
//! - [`PaperBrokerage`]: a simulated brokerage for paper trading and tests

mod order_manager;
mod paper;
pub mod retry;

pub use order_manager::{AppliedFill, CancelAction, OrderManager, OrderUpdate, ReconcileReport};
pub use paper::{PaperBrokerage, PaperSession};
pub use retry::{retry, submit_with_retry, RetryError, RetryPolicy};
