//! Core data model.
//!
//! A work item is an opaque payload plus the lifecycle metadata the engine
//! needs to move it from a producer, through a worker, and back. Items cross
//! the shared store as JSON; the engine never inspects the payload itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error string recorded when the timeout guard fires before the worker's
/// real completion.
pub const TIMEOUT_ERROR: &str = "timeout";

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier. Sole key for in-flight tracking and completion
    /// correlation.
    pub id: WorkId,

    /// The producer's payload. Opaque to the engine.
    pub payload: serde_json::Value,

    /// Current lifecycle status.
    pub status: Status,

    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Result value set on successful completion. Mutually exclusive
    /// with `error`.
    pub completed_payload: Option<serde_json::Value>,

    /// Error string set on failed or timed-out completion.
    pub error: Option<String>,

    /// Key of the completed queue owned by the producer instance that
    /// enqueued this item. Assigned at creation, never mutated. If that
    /// producer is gone, records routed here simply accumulate in the store.
    pub result_destination: String,
}

impl WorkItem {
    pub fn new(payload: serde_json::Value, result_destination: String) -> Self {
        Self {
            id: WorkId::new(),
            payload,
            status: Status::Pending,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            completed_payload: None,
            error: None,
            result_destination,
        }
    }

    /// Mark the item dispatched to a worker.
    pub(crate) fn mark_started(&mut self) {
        self.status = Status::Working;
        self.started_at = Some(Utc::now());
    }

    /// Apply a completion outcome. Terminal states are absorbing: once the
    /// item is completed or errored, later calls are ignored.
    pub(crate) fn mark_finished(&mut self, outcome: std::result::Result<serde_json::Value, String>) {
        if self.status.is_terminal() {
            return;
        }
        match outcome {
            Ok(value) => {
                self.status = Status::Completed;
                self.completed_payload = Some(value);
            }
            Err(error) => {
                self.status = Status::Error;
                self.error = Some(error);
            }
        }
        self.ended_at = Some(Utc::now());
    }

    /// Wall-clock execution time, when both endpoints are known.
    pub fn work_time_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.ended_at?);
        u64::try_from(end.signed_duration_since(start).num_milliseconds()).ok()
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item. Monotonic: `pending → working →
/// {completed | error}`, terminal states absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Enqueued, waiting for a worker.
    Pending,
    /// Dispatched to a worker, tracked in the working set.
    Working,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with an error (worker-reported or timeout). Terminal.
    Error,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Working) | (Working, Completed) | (Working, Error)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Error)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Working => "working",
            Status::Completed => "completed",
            Status::Error => "error",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Queue Entry
// ---------------------------------------------------------------------------

/// What actually travels on a queue: real work, or the stop sentinel.
///
/// Resolved once at enqueue time; downstream code matches the variant
/// instead of re-inspecting payloads. The sentinel is never produced by
/// `enqueue` and never enters the working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEntry {
    Work(WorkItem),
    Stop,
}
