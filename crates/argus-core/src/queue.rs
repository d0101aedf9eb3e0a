//! Work-queue contract for ad-hoc check execution requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// An operator-initiated request to run a check immediately, outside its
/// schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhocRequest {
    /// Namespace of the check.
    pub namespace: String,
    /// Check name.
    pub check: String,
    /// Who asked for the run.
    #[serde(default)]
    pub creator: String,
    /// Why.
    #[serde(default)]
    pub reason: String,
}

/// A named work queue with at-least-once pop semantics.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Appends a request to the queue.
    async fn enqueue(&self, req: AdhocRequest) -> Result<(), StoreError>;

    /// Pops the oldest request, or `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<AdhocRequest>, StoreError>;
}
