//! Repository activity harvesting
//!
//! # Overview
//!
//! Collects commit activity of many repositories from a rate limited, paginated hosting API.
//! A pool of access tokens is rotated whenever one runs out of quota, pages of a resource are fetched
//! concurrently in batches no larger than the quota left, and the fetched commits are grouped into
//! weekly or monthly buckets of distinct contributors.
//!
//! Repositories are processed one after another. Every completed repository is merged into a run-wide
//! aggregate kept on disk, so a killed run resumes where it stopped without fetching completed
//! repositories again.
//!
//! The `api` feature exposes only the types and traits an API client implements,
//! the `engine` feature adds the harvesting machinery.

pub mod api;
pub mod buckets;
pub mod config;

#[cfg(feature = "engine")]
pub mod credentials;
#[cfg(feature = "engine")]
pub mod directory;
#[cfg(feature = "engine")]
pub mod ledger;
#[cfg(feature = "engine")]
pub mod orchestrator;
#[cfg(feature = "engine")]
pub mod scheduler;

#[cfg(feature = "engine")]
pub use credentials::CredentialPool;
#[cfg(feature = "engine")]
pub use ledger::{ProgressLedger, ProgressRecord};
#[cfg(feature = "engine")]
pub use orchestrator::{HarvestOrchestrator, HarvestReport};
#[cfg(feature = "engine")]
pub use scheduler::BatchScheduler;
