//! Test utilities for the pipeline crate.
//!
//! Shared helpers for both unit tests (in `src/`) and integration tests (in
//! `tests/`). Only compiled for tests or under the `test-support` feature.

pub mod job_pipeline;
