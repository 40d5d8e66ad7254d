//! # jobtrack-jobs
//!
//! Background job progress coordination.
//!
//! This crate provides:
//! - One [`JobCoordinator`] per job class, driving
//!   `Idle -> Starting -> Running -> Finishing -> Idle`
//! - A [`Poller`] that queries remote progress at a fixed cadence
//! - A [`CompletionGuard`] so finish side effects run once per episode
//! - [`RecoveryBootstrap`] to resume jobs that outlived the previous process
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use jobtrack_client::HttpProgressService;
//! use jobtrack_jobs::{CoordinatorConfig, CoordinatorRegistry, RecoveryBootstrap};
//! use jobtrack_store::FileStore;
//!
//! let registry = CoordinatorRegistry::builder(
//!     Arc::new(HttpProgressService::from_env()?),
//!     Arc::new(FileStore::new(".jobtrack")),
//! )
//! .with_config(CoordinatorConfig::from_env())
//! .build();
//!
//! RecoveryBootstrap::run(&registry);
//!
//! registry.on_finish(JobClass::SiteScrape, |report| {
//!     println!("scraped {} sites", report.units.len());
//! });
//! registry
//!     .start(JobClass::SiteScrape, vec![TrackedUnit::new(1, "siteA")])
//!     .await?;
//! ```

pub mod completion;
pub mod coordinator;
pub mod guard;
pub mod poller;
pub mod recovery;
pub mod registry;

// Re-export core types
pub use jobtrack_core::*;

pub use coordinator::{CoordinatorConfig, FinishCallback, JobCoordinator};
pub use guard::CompletionGuard;
pub use poller::{PollHandle, PollId, Poller, TickSink, TickVerdict};
pub use recovery::{RecoveryBootstrap, RecoveryReport};
pub use registry::{CoordinatorRegistry, RegistryBuilder};
