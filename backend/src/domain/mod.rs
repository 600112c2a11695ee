//! Domain primitives, aggregates, and job runners.
//!
//! Purpose: Define strongly typed pipeline entities and the services that
//! drive them. Keep types immutable where possible and document invariants
//! and serialisation contracts (serde) in each type's Rustdoc.
//!
//! Public surface:
//! - Error / ErrorCode — stable error payload shared by all operations.
//! - Creation, TrialCreation, TrialRequest — persisted job rows.
//! - CreationJobService, LandscapeJobService, TrialPoolService — runners.
//! - JobDispatcher — queue callback routing jobs to their runner.
//! - ports — trait seams for driven adapters.

pub mod creation;
pub mod creation_job;
pub mod dispatch;
pub mod error;
mod generation;
pub mod identity;
pub mod landscape_job;
pub mod ports;
pub mod trial;
pub mod trial_pool;

pub use self::creation::{
    CompletionUpdate, Creation, CreationMetadata, CreationStatus, JobFailure, JobFailureKind,
    JobOutcome, LandscapeState, Lineage, NewCreation,
};
pub use self::creation_job::{
    CreationJobPorts, CreationJobService, JobRunOutcome, Requester, SubmitCreationRequest,
};
pub use self::dispatch::JobDispatcher;
pub use self::error::{Error, ErrorCode, ErrorValidationError};
pub use self::identity::{
    ClientId, ClientIdValidationError, CreationId, ProviderId, TrialId, TrialRequestId, UserId,
};
pub use self::landscape_job::{LandscapeJobService, SubmitLandscapeRequest};
pub use self::trial::{NewTrialCreation, NewTrialRequest, TrialCreation, TrialRequest};
pub use self::trial_pool::{
    SubmitTrialRequest, TrialPoolPorts, TrialPoolService, TrialSubmission,
};

/// Convenient pipeline result alias.
pub type PipelineResult<T> = Result<T, Error>;
