//! Key and channel naming for shared state.
//!
//! A logical queue name `Q` maps to a small family of store keys. Everything
//! the engine touches in the external store goes through these helpers so
//! the layout lives in one place.

use uuid::Uuid;

const NS: &str = "relayq";

/// FIFO list of not-yet-dispatched entries for `queue`.
pub fn pending(queue: &str) -> String {
    format!("{NS}.{queue}.pending")
}

/// Hash of in-flight items for `queue`, keyed by work item id.
pub fn working(queue: &str) -> String {
    format!("{NS}.{queue}.working")
}

/// FIFO list of finished items owned by one producer instance.
pub fn completed(queue: &str, instance: &Uuid) -> String {
    format!("{NS}.{queue}.completed.{instance}")
}

/// Shared counter of live worker subscriptions on `queue`.
pub fn worker_count(queue: &str) -> String {
    format!("{NS}.{queue}.worker-count")
}

/// Pub/sub channel carrying stats heartbeats for `queue`.
pub fn stats_channel(queue: &str) -> String {
    format!("{NS}.{queue}.stats")
}
