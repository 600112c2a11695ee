//! Outbound adapters implementing domain ports for external infrastructure.
//!
//! This module follows the hexagonal architecture pattern: adapters are thin
//! translators between domain types and infrastructure-specific
//! representations and contain no business logic.
//!
//! - **gateway**: reqwest-backed provider gateway with the bounded per-call
//!   deadline and capped error-body previews.
//! - **queue**: in-process Tokio channel queue delivering jobs to the
//!   dispatcher.

pub mod gateway;
pub mod queue;

pub use gateway::{HttpProviderGateway, ProviderHttpIdentity};
pub use queue::TokioJobQueue;
