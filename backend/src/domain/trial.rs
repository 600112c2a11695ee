//! Anonymous trial records.
//!
//! Trial creations mirror the authenticated [`Creation`](super::Creation)
//! shape but are keyed by an anonymous client, carry no credit cost, and store
//! the originating prompt as the pool cache key. Trial requests are thin link
//! rows so several anonymous sessions can share one completed result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::creation::{CreationMetadata, CreationStatus};
use super::identity::{ClientId, TrialId, TrialRequestId};

/// One anonymous generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialCreation {
    /// Row identifier.
    pub id: TrialId,
    /// Anonymous client that triggered the attempt; the reserved pool
    /// identity owns background refill rows.
    pub client_id: ClientId,
    /// Originating prompt, the pool cache key.
    pub prompt: String,
    /// Lifecycle state; same machine as authenticated creations.
    pub status: CreationStatus,
    /// Stored filename; a placeholder until the row completes.
    pub filename: String,
    /// Public URL, set once completed.
    pub url: Option<String>,
    /// When the row was inserted; bounds pool membership by age.
    pub created_at: DateTime<Utc>,
    /// Structured metadata; trial rows never carry lineage or landscapes.
    pub metadata: CreationMetadata,
}

impl TrialCreation {
    /// Whether the row still awaits reconciliation.
    pub fn is_creating(&self) -> bool {
        self.status == CreationStatus::Creating
    }
}

/// Fields required to insert a new trial creation row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrialCreation {
    /// Owning anonymous client.
    pub client_id: ClientId,
    /// Originating prompt.
    pub prompt: String,
    /// Placeholder filename.
    pub filename: String,
    /// When the row is inserted.
    pub created_at: DateTime<Utc>,
    /// Initial metadata; its outcome must be pending.
    pub metadata: CreationMetadata,
}

/// Link row associating an anonymous client and prompt with a trial creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRequest {
    /// Row identifier.
    pub id: TrialRequestId,
    /// Requesting client.
    pub client_id: ClientId,
    /// Prompt the client submitted.
    pub prompt: String,
    /// Referenced trial creation; cleared when the client discards the
    /// result.
    pub trial_id: Option<TrialId>,
    /// When the link was created.
    pub created_at: DateTime<Utc>,
    /// When the result became available to this client. Cache hits are
    /// fulfilled immediately; fresh submissions on completion.
    pub fulfilled_at: Option<DateTime<Utc>>,
}

/// Fields required to insert a new trial request link.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrialRequest {
    /// Requesting client.
    pub client_id: ClientId,
    /// Prompt the client submitted.
    pub prompt: String,
    /// Referenced trial creation.
    pub trial_id: TrialId,
    /// When the link is created.
    pub created_at: DateTime<Utc>,
    /// Immediate fulfilment timestamp for cache hits, `None` otherwise.
    pub fulfilled_at: Option<DateTime<Utc>>,
}
