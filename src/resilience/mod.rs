//! Retry policies for backend connections and the retry queue for failed
//! index writes.

pub mod retry;
pub mod retry_queue;

pub use retry::{retry, RetryConfig};
pub use retry_queue::{RetryItem, RetryOutcome, RetryQueue, RetryQueueStats};
