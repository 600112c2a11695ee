//! Creation job pipeline library.
//!
//! The domain layer owns the job state machine (submission, provider
//! invocation, reconciliation, retry), the credit-ledger compensation rules,
//! the landscape flow, and the anonymous trial pool. Driven collaborators
//! (storage, ledger, provider gateway, queue) are consumed through ports in
//! [`domain::ports`]; the adapters this crate owns live in [`outbound`].

pub mod config;
pub mod domain;
pub mod outbound;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::JobPipelineConfig;
