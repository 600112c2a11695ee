//! Domain ports defining the edges of the hexagon.
//!
//! Ports describe how the pipeline interacts with driven adapters (storage,
//! the credit ledger, the provider gateway, the job queue). Each trait
//! exposes strongly typed errors so adapters map their failures into
//! predictable variants instead of returning `anyhow::Result`, and each file
//! ships a fixture implementation plus a mockall mock for tests.

mod access_token_minter;
mod creation_repository;
mod credit_ledger;
mod image_normalizer;
mod job_queue;
mod provider_gateway;
mod provider_repository;
mod storage_sink;
mod trial_repository;

#[cfg(test)]
pub use access_token_minter::MockAccessTokenMinter;
pub use access_token_minter::{AccessTokenError, AccessTokenMinter, FixtureAccessTokenMinter};
#[cfg(test)]
pub use creation_repository::MockCreationRepository;
pub use creation_repository::{
    CreationRepository, CreationRepositoryError, FixtureCreationRepository,
};
#[cfg(test)]
pub use credit_ledger::MockCreditLedger;
pub use credit_ledger::{CreditLedger, CreditLedgerError, FixtureCreditLedger};
#[cfg(test)]
pub use image_normalizer::MockImageNormalizer;
pub use image_normalizer::{FixtureImageNormalizer, ImageNormalizer, ImageNormalizerError};
#[cfg(test)]
pub use job_queue::MockJobQueue;
pub use job_queue::{FixtureJobQueue, JobDispatchError, JobHandler, JobQueue, QueuedJob};
#[cfg(test)]
pub use provider_gateway::MockProviderGateway;
pub use provider_gateway::{
    FixtureProviderGateway, GatewayImage, GatewayPayload, ImageAttributes, ProviderGateway,
    ProviderGatewayError,
};
#[cfg(test)]
pub use provider_repository::MockProviderRepository;
pub use provider_repository::{
    FixtureProviderRepository, Provider, ProviderRepository, ProviderRepositoryError,
    ProviderStatus,
};
#[cfg(test)]
pub use storage_sink::MockStorageSink;
pub use storage_sink::{FixtureStorageSink, StorageSink, StorageSinkError};
#[cfg(test)]
pub use trial_repository::MockTrialRepository;
pub use trial_repository::{FixtureTrialRepository, TrialRepository, TrialRepositoryError};
