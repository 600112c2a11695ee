//! Creation aggregate and its structured metadata.
//!
//! The source system accreted an ad-hoc JSON blob per creation; here the
//! metadata is a well-defined record whose terminal fields live in a tagged
//! [`JobOutcome`] union, so only the fields legal for the current state can
//! exist. The one deliberately loose member is `args`, the passthrough map of
//! provider-specific request arguments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::identity::{CreationId, ProviderId, UserId};

/// Lifecycle state of a creation row.
///
/// The only transitions are `Creating -> Completed` and `Creating -> Failed`;
/// an explicit retry resets a row back to `Creating` in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationStatus {
    /// Submitted and awaiting reconciliation.
    Creating,
    /// Terminal success; filename and url are set.
    Completed,
    /// Terminal failure; the failure detail lives in the metadata outcome.
    Failed,
}

/// Category of a terminal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailureKind {
    /// Provider missing or inactive; detected before any network call.
    InvalidProvider,
    /// Provider call exceeded the bounded deadline.
    Timeout,
    /// Provider responded non-2xx or the transport failed short of a timeout.
    ProviderError,
    /// Generation succeeded but persisting the artifact failed.
    UploadFailed,
}

impl JobFailureKind {
    /// Stable code stored in metadata and surfaced to clients.
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidProvider => "invalid_provider",
            Self::Timeout => "timeout",
            Self::ProviderError => "provider_error",
            Self::UploadFailed => "upload_failed",
        }
    }
}

/// Structured description of a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Failure category.
    pub kind: JobFailureKind,
    /// Human-readable message surfaced to the owning client.
    pub message: String,
    /// Size-capped preview of the provider's error body, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
}

impl JobFailure {
    /// Failure for a missing or inactive provider.
    pub fn invalid_provider(message: impl Into<String>) -> Self {
        Self {
            kind: JobFailureKind::InvalidProvider,
            message: message.into(),
            provider_error: None,
        }
    }

    /// Failure for a provider call that exceeded its deadline.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: JobFailureKind::Timeout,
            message: message.into(),
            provider_error: None,
        }
    }

    /// Failure for a non-success provider response or transport error.
    pub fn provider_error(message: impl Into<String>, body_preview: Option<String>) -> Self {
        Self {
            kind: JobFailureKind::ProviderError,
            message: message.into(),
            provider_error: body_preview,
        }
    }

    /// Failure for an artifact that could not be persisted.
    pub fn upload_failed(message: impl Into<String>) -> Self {
        Self {
            kind: JobFailureKind::UploadFailed,
            message: message.into(),
            provider_error: None,
        }
    }
}

/// Terminal (or pending) outcome of one submission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Submission recorded; reconciliation has not run yet.
    Pending,
    /// Generation succeeded and the artifact is durable.
    Completed {
        /// When reconciliation recorded success.
        completed_at: DateTime<Utc>,
        /// Wall-clock time from submission to success. Dropped (not clamped)
        /// when the terminal timestamp precedes `started_at`.
        duration_ms: Option<u64>,
        /// Declared or defaulted image width.
        width: u32,
        /// Declared or defaulted image height.
        height: u32,
        /// Dominant colour declared by the provider, when present.
        color: Option<String>,
    },
    /// Generation failed; the row holds the failure detail.
    Failed {
        /// When reconciliation recorded the failure.
        failed_at: DateTime<Utc>,
        /// Wall-clock time from submission to failure; same drop policy as
        /// the completed variant.
        duration_ms: Option<u64>,
        /// Structured failure detail.
        failure: JobFailure,
        /// Whether the compensating refund has been issued. Guards the
        /// exactly-once refund across duplicate deliveries and crashes.
        credits_refunded: bool,
    },
}

impl JobOutcome {
    /// Whether this outcome still awaits reconciliation.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Landscape (secondary generation) state tracked inside a creation.
///
/// Replaces the source system's `"error:<message>"` string-prefix encoding
/// with a discriminated union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LandscapeState {
    /// No landscape has been requested for this creation.
    NotRequested,
    /// A landscape generation is in flight. Only one may run at a time.
    Loading {
        /// Provider chosen for this landscape attempt.
        provider_id: ProviderId,
        /// Provider method name.
        method: String,
        /// Provider-specific request arguments.
        args: Map<String, Value>,
        /// Credits charged for this attempt; refunded on failure.
        credit_cost: i64,
        /// When the attempt was submitted.
        started_at: DateTime<Utc>,
        /// Filename of the previous landscape, deleted after a successful
        /// regeneration is durable.
        previous_filename: Option<String>,
    },
    /// A landscape artifact is durable.
    Ready {
        /// Public URL of the landscape image.
        url: String,
        /// Stored filename of the landscape image.
        filename: String,
    },
    /// The last landscape attempt failed.
    Failed {
        /// Human-readable failure message.
        message: String,
        /// Whether the compensating refund has been issued.
        credits_refunded: bool,
    },
}

impl LandscapeState {
    /// Whether a landscape generation is currently in flight.
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }
}

/// Mutation lineage linking a creation to the image it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Direct source of this mutation.
    pub mutate_of_id: CreationId,
    /// Ordered ancestor chain, oldest first, ending with `mutate_of_id`.
    pub history: Vec<CreationId>,
}

/// Structured metadata carried by every creation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationMetadata {
    /// Provider selected at submission.
    pub provider_id: ProviderId,
    /// Provider method name.
    pub method: String,
    /// Passthrough provider-specific request arguments.
    pub args: Map<String, Value>,
    /// Audit token minted per attempt; a retry mints a fresh one.
    pub submission_token: Uuid,
    /// When the attempt was submitted.
    pub started_at: DateTime<Utc>,
    /// Deadline after which the attempt may be treated as abandoned.
    pub timeout_at: DateTime<Utc>,
    /// Mutation lineage, when this creation derives from another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
    /// Pending or terminal outcome of this attempt.
    pub outcome: JobOutcome,
    /// Landscape sub-state.
    pub landscape: LandscapeState,
}

impl CreationMetadata {
    /// Metadata for a freshly submitted attempt.
    pub fn pending(
        provider_id: ProviderId,
        method: impl Into<String>,
        args: Map<String, Value>,
        lineage: Option<Lineage>,
        started_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id,
            method: method.into(),
            args,
            submission_token: Uuid::new_v4(),
            started_at,
            timeout_at,
            lineage,
            outcome: JobOutcome::Pending,
            landscape: LandscapeState::NotRequested,
        }
    }

    /// Transition to the completed outcome.
    pub fn into_completed(
        mut self,
        completed_at: DateTime<Utc>,
        width: u32,
        height: u32,
        color: Option<String>,
    ) -> Self {
        self.outcome = JobOutcome::Completed {
            completed_at,
            duration_ms: duration_ms_between(self.started_at, completed_at),
            width,
            height,
            color,
        };
        self
    }

    /// Transition to the failed outcome with the refund still outstanding.
    pub fn into_failed(mut self, failure: JobFailure, failed_at: DateTime<Utc>) -> Self {
        self.outcome = JobOutcome::Failed {
            failed_at,
            duration_ms: duration_ms_between(self.started_at, failed_at),
            failure,
            credits_refunded: false,
        };
        self
    }

    /// Whether the attempt has outlived its submission deadline.
    pub fn is_past_timeout(&self, now: DateTime<Utc>) -> bool {
        now > self.timeout_at
    }
}

/// Elapsed milliseconds between submission and a terminal timestamp.
///
/// Negative spans are dropped, not clamped: clock skew between writers can
/// place the terminal timestamp before `started_at`, and the original system
/// records no duration in that case.
pub fn duration_ms_between(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Option<u64> {
    u64::try_from(ended_at.signed_duration_since(started_at).num_milliseconds()).ok()
}

/// Placeholder filename written at submission, before any artifact exists.
pub fn placeholder_filename(submission_token: Uuid) -> String {
    format!("pending/{submission_token}.png")
}

/// One user-owned generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creation {
    /// Row identifier; stable across in-place retries.
    pub id: CreationId,
    /// Owning user.
    pub owner: UserId,
    /// Lifecycle state.
    pub status: CreationStatus,
    /// Credits charged for the current attempt; zero for unpaid jobs.
    pub credit_cost: i64,
    /// Whether the image is publicly published (drives lineage visibility).
    pub published: bool,
    /// Stored filename; a placeholder until the row completes.
    pub filename: String,
    /// Public URL, set once completed.
    pub url: Option<String>,
    /// Structured metadata for audit, lineage, and reconciliation.
    pub metadata: CreationMetadata,
}

impl Creation {
    /// Whether the row still awaits reconciliation.
    pub fn is_creating(&self) -> bool {
        self.status == CreationStatus::Creating
    }
}

/// Fields required to insert a new creation row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCreation {
    /// Owning user.
    pub owner: UserId,
    /// Credits charged for this attempt.
    pub credit_cost: i64,
    /// Placeholder filename.
    pub filename: String,
    /// Initial metadata; its outcome must be pending.
    pub metadata: CreationMetadata,
}

/// Fields written when a row transitions to `Completed`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionUpdate {
    /// Final stored filename.
    pub filename: String,
    /// Public URL of the artifact.
    pub url: String,
    /// Metadata carrying the completed outcome.
    pub metadata: CreationMetadata,
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0)
            .single()
            .expect("valid fixture timestamp")
    }

    fn pending_metadata() -> CreationMetadata {
        let started_at = base_time();
        CreationMetadata::pending(
            ProviderId::new(1),
            "txt2img",
            Map::new(),
            None,
            started_at,
            started_at + chrono::TimeDelta::seconds(60),
        )
    }

    #[test]
    fn duration_is_dropped_when_negative() {
        let started_at = base_time();
        let earlier = started_at - chrono::TimeDelta::milliseconds(5);
        assert_eq!(duration_ms_between(started_at, earlier), None);
        assert_eq!(
            duration_ms_between(started_at, started_at + chrono::TimeDelta::milliseconds(750)),
            Some(750)
        );
    }

    #[test]
    fn into_failed_leaves_the_refund_outstanding() {
        let failed_at = base_time() + chrono::TimeDelta::seconds(3);
        let metadata = pending_metadata().into_failed(JobFailure::timeout("too slow"), failed_at);

        let JobOutcome::Failed {
            duration_ms,
            credits_refunded,
            failure,
            ..
        } = metadata.outcome
        else {
            panic!("outcome must be failed");
        };
        assert_eq!(duration_ms, Some(3_000));
        assert!(!credits_refunded);
        assert_eq!(failure.kind, JobFailureKind::Timeout);
    }

    #[test]
    fn into_completed_records_dimensions() {
        let completed_at = base_time() + chrono::TimeDelta::seconds(2);
        let metadata =
            pending_metadata().into_completed(completed_at, 1024, 1024, Some("#aabbcc".to_owned()));

        assert!(matches!(
            metadata.outcome,
            JobOutcome::Completed {
                width: 1024,
                height: 1024,
                ..
            }
        ));
    }

    #[rstest]
    #[case(JobFailureKind::InvalidProvider, "invalid_provider")]
    #[case(JobFailureKind::Timeout, "timeout")]
    #[case(JobFailureKind::ProviderError, "provider_error")]
    #[case(JobFailureKind::UploadFailed, "upload_failed")]
    fn failure_kinds_expose_stable_codes(#[case] kind: JobFailureKind, #[case] code: &str) {
        assert_eq!(kind.code(), code);
    }

    #[test]
    fn timeout_check_is_strictly_after_the_deadline() {
        let metadata = pending_metadata();
        assert!(!metadata.is_past_timeout(metadata.timeout_at));
        assert!(metadata.is_past_timeout(metadata.timeout_at + chrono::TimeDelta::seconds(1)));
    }

    #[test]
    fn landscape_state_serialises_with_a_state_tag() {
        let encoded = serde_json::to_value(LandscapeState::Ready {
            url: "https://cdn.example/landscape.png".to_owned(),
            filename: "landscape.png".to_owned(),
        })
        .expect("state serialises");
        assert_eq!(encoded["state"], "ready");
    }
}
