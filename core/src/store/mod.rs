// Store module — message custody and deduplication

pub mod outbox;
pub mod seen;

pub use outbox::{QueueError, QueuedMessage, RetryDecision, RetryStrategy, StoreAndForwardQueue};
pub use seen::SeenCache;
