//! Retry, watchdog, and supervised-task primitives shared by every
//! long-running loop in the hub (spec §4.2).

pub mod retry;
pub mod supervise;
pub mod watchdog;

pub use retry::{retry_send, RetryPolicy};
pub use supervise::supervised_task;
pub use watchdog::Watchdog;
