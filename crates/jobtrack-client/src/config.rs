//! Client configuration and backend routes.
//!
//! Configuration is read from the environment (after `dotenvy` has loaded any
//! `.env` file):
//!
//! | Variable | Default |
//! |---|---|
//! | `JOBTRACK_API_BASE` | `http://localhost:8000` |
//! | `JOBTRACK_API_TOKEN` | unset |
//! | `JOBTRACK_REQUEST_TIMEOUT_SECS` | `10` |

use std::time::Duration;

use jobtrack_core::{defaults, JobClass};

/// Placeholder replaced by the unit's progress file name.
pub const UNIT_PLACEHOLDER: &str = "{unit}";

/// Routes used for one job class, relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRoutes {
    /// GET; may contain `{unit}`.
    pub progress: String,
    /// POST; when it contains `{unit}` it is called once per unit.
    pub reset: String,
    /// POST; multi-unit classes send the unit names as a JSON array.
    pub trigger: String,
}

impl ClassRoutes {
    pub fn new(
        progress: impl Into<String>,
        reset: impl Into<String>,
        trigger: impl Into<String>,
    ) -> Self {
        Self {
            progress: progress.into(),
            reset: reset.into(),
            trigger: trigger.into(),
        }
    }
}

/// Route table for every job class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    routes: [ClassRoutes; 3],
}

impl Endpoints {
    pub fn for_class(&self, job_class: JobClass) -> &ClassRoutes {
        &self.routes[job_class.index()]
    }

    /// Override the routes of one class.
    pub fn with_routes(mut self, job_class: JobClass, routes: ClassRoutes) -> Self {
        self.routes[job_class.index()] = routes;
        self
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            routes: JobClass::ALL.map(default_routes),
        }
    }
}

fn default_routes(job_class: JobClass) -> ClassRoutes {
    match job_class {
        JobClass::SiteScrape => ClassRoutes::new(
            "/scraping/progress/{unit}",
            "/scraping/reset_progress/{unit}",
            "/scraping/scraping",
        ),
        JobClass::DocumentVectorization => ClassRoutes::new(
            "/scraping/vectorization_progress",
            "/scraping/vectorization_reset_progress",
            "/scraping/process_and_vectorize",
        ),
        JobClass::CorpusVectorization => ClassRoutes::new(
            "/pdf_manual/admin/vectorization_progress",
            "/pdf_manual/admin/vectorization_reset_progress",
            "/pdf_manual/admin/vectorize",
        ),
    }
}

/// Configuration for [`crate::HttpProgressService`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Sent as a bearer token when present.
    pub api_token: Option<String>,
    pub request_timeout: Duration,
    pub endpoints: Endpoints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::API_BASE_URL.to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS),
            endpoints: Endpoints::default(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        let base_url = std::env::var("JOBTRACK_API_BASE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| defaults::API_BASE_URL.to_string());

        let api_token = std::env::var("JOBTRACK_API_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let timeout_secs = std::env::var("JOBTRACK_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::REQUEST_TIMEOUT_SECS)
            .max(1);

        Self {
            base_url,
            api_token,
            request_timeout: Duration::from_secs(timeout_secs),
            endpoints: Endpoints::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000");
        assert_eq!(config.api_token, None);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::default()
            .with_base_url("http://backend:9000")
            .with_api_token("secret")
            .with_request_timeout(Duration::from_secs(2));
        assert_eq!(config.base_url, "http://backend:9000");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_default_routes() {
        let endpoints = Endpoints::default();
        let scrape = endpoints.for_class(JobClass::SiteScrape);
        assert_eq!(scrape.progress, "/scraping/progress/{unit}");
        assert_eq!(scrape.trigger, "/scraping/scraping");

        let vector = endpoints.for_class(JobClass::DocumentVectorization);
        assert_eq!(vector.progress, "/scraping/vectorization_progress");
        assert_eq!(vector.trigger, "/scraping/process_and_vectorize");

        let corpus = endpoints.for_class(JobClass::CorpusVectorization);
        assert!(corpus.progress.starts_with("/pdf_manual/admin/"));
    }

    #[test]
    fn test_override_routes() {
        let endpoints = Endpoints::default().with_routes(
            JobClass::CorpusVectorization,
            ClassRoutes::new("/corpus/progress", "/corpus/reset", "/corpus/run"),
        );
        assert_eq!(
            endpoints.for_class(JobClass::CorpusVectorization).trigger,
            "/corpus/run"
        );
        assert_eq!(
            endpoints.for_class(JobClass::SiteScrape).trigger,
            "/scraping/scraping"
        );
    }
}
