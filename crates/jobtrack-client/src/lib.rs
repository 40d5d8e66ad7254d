//! # jobtrack-client
//!
//! Remote progress service adapters.
//!
//! - [`HttpProgressService`] talks to the scraping/vectorization backend over
//!   HTTP, using the routes in [`Endpoints`].
//! - `MockProgressService` (feature `mock`) replays scripted responses for
//!   tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use jobtrack_client::{ClientConfig, HttpProgressService};
//!
//! let service = HttpProgressService::new(ClientConfig::from_env())?;
//! let reading = service.get_progress(JobClass::DocumentVectorization, &unit).await?;
//! ```

pub mod config;
pub mod http;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{ClassRoutes, ClientConfig, Endpoints};
pub use http::{progress_file_name, HttpProgressService};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockFailure, MockProgressService, MockResponse};
