//! # jobtrack-store
//!
//! Durable storage for coordinator records.
//!
//! This crate provides:
//! - [`MemoryStore`], an in-process adapter for tests and embedding
//! - [`FileStore`], one JSON document per key with atomic replace
//! - [`RecordStore`], the typed layer that maps job classes to storage keys
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jobtrack_store::{FileStore, RecordStore};
//!
//! let records = RecordStore::new(Arc::new(FileStore::new(".jobtrack")));
//! if let Some(record) = records.load(JobClass::SiteScrape)? {
//!     println!("scrape was running for {:?}", record.unit_names);
//! }
//! ```

pub mod file;
pub mod memory;
pub mod records;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use records::RecordStore;

// Re-export core types for consumers that only depend on this crate
pub use jobtrack_core::{Error, PersistedRecord, PersistenceAdapter, Result};
