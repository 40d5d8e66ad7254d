//! # jobtrack-core
//!
//! Core types, traits, and abstractions for jobtrack.
//!
//! This crate provides the domain model shared by the other jobtrack crates:
//! job classes and tracked units, the progress payload codec, the error
//! taxonomy, the remote-service and persistence traits, and the event bus.

pub mod codec;
pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use codec::{parse_progress, ParseError, TerminalMarkers};
pub use error::{Error, Result};
pub use events::{CoordinatorEvent, EventBus, EventEnvelope};
pub use models::*;
pub use traits::*;
