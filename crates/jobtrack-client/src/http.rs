//! HTTP implementation of [`ProgressService`].
//!
//! Status mapping:
//! - 404 on a progress query is [`ProgressReading::NotStarted`]; on a reset it
//!   is ignored (nothing to clear).
//! - 401/403 is [`Error::Unauthorized`].
//! - Any other 4xx on trigger or reset is [`Error::Rejected`].
//! - Everything else (other 4xx on progress, 5xx, timeouts, connection
//!   failures) is [`Error::Request`] and retried by the poller.
//! - A progress body that cannot be decoded is [`Error::Serialization`].

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, info, warn};

use jobtrack_core::{
    parse_progress, Error, JobClass, ProgressReading, ProgressService, Result, TrackedUnit,
    TriggerAck,
};

use crate::config::{ClientConfig, UNIT_PLACEHOLDER};

/// Longest response body excerpt kept in error messages.
const BODY_EXCERPT_CHARS: usize = 200;

/// Name of the server-side progress file of a unit.
///
/// The backend stores one progress file per site with spaces replaced by
/// underscores.
pub fn progress_file_name(unit_name: &str) -> String {
    unit_name.trim().replace(' ', "_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Progress,
    Reset,
    Trigger,
}

/// Progress service backed by the scraping/vectorization REST API.
pub struct HttpProgressService {
    client: Client,
    base_url: Url,
    config: ClientConfig,
}

impl HttpProgressService {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid API base URL {}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "API base URL {} cannot carry a path",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        info!(
            base_url = %base_url,
            timeout_secs = config.request_timeout.as_secs(),
            authenticated = config.api_token.is_some(),
            "Initializing HTTP progress service"
        );

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve a route against the base URL.
    ///
    /// `{unit}` becomes the unit's progress file name, percent-encoded as a
    /// single path segment.
    fn url(&self, route: &str, unit: Option<&TrackedUnit>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Config(format!("API base URL {} cannot carry a path", self.base_url)))?;
            segments.pop_if_empty();
            for segment in route.split('/').filter(|s| !s.is_empty()) {
                if segment == UNIT_PLACEHOLDER {
                    let unit = unit.ok_or_else(|| {
                        Error::Config(format!("route {route} needs a unit"))
                    })?;
                    segments.push(&progress_file_name(&unit.name));
                } else {
                    segments.push(segment);
                }
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn reset_one(&self, url: Url) -> Result<()> {
        debug!(url = %url, "Resetting remote progress");
        let response = self.request(Method::POST, url.clone()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(url = %url, "No progress record to reset");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(Call::Reset, status, &url, &body));
        }
        Ok(())
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
    cut.push('…');
    cut
}

fn status_error(call: Call, status: StatusCode, url: &Url, body: &str) -> Error {
    let detail = format!("HTTP {} from {}: {}", status.as_u16(), url.path(), excerpt(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(detail),
        s if s.is_client_error() && call != Call::Progress => Error::Rejected(detail),
        _ => Error::Request(detail),
    }
}

/// Decode a trigger acknowledgement.
///
/// The backend answers with `{"status": ..., "message": ...}` in most cases but
/// some routes return plain text or nothing at all; the job was accepted
/// either way, so the body is never a reason to fail.
fn parse_ack(body: &str) -> TriggerAck {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return TriggerAck::default();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => {
            let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
            TriggerAck {
                status: text("status"),
                message: text("message").or_else(|| text("detail")),
            }
        }
        _ => TriggerAck {
            status: None,
            message: Some(excerpt(trimmed)),
        },
    }
}

#[async_trait]
impl ProgressService for HttpProgressService {
    async fn get_progress(
        &self,
        job_class: JobClass,
        unit: &TrackedUnit,
    ) -> Result<ProgressReading> {
        let routes = self.config.endpoints.for_class(job_class);
        let url = self.url(&routes.progress, Some(unit))?;

        let response = self.request(Method::GET, url.clone()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(ProgressReading::NotStarted);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(Call::Progress, status, &url, &body));
        }

        let body = response.text().await?;
        Ok(parse_progress(Some(&body))?)
    }

    async fn reset_progress(&self, job_class: JobClass, units: &[TrackedUnit]) -> Result<()> {
        let routes = self.config.endpoints.for_class(job_class);

        if !routes.reset.contains(UNIT_PLACEHOLDER) {
            let url = self.url(&routes.reset, None)?;
            return self.reset_one(url).await;
        }

        let urls = units
            .iter()
            .map(|unit| self.url(&routes.reset, Some(unit)))
            .collect::<Result<Vec<_>>>()?;
        let results = join_all(urls.into_iter().map(|url| self.reset_one(url))).await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!(job_class = %job_class, error = %e, "Progress reset failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn trigger_job(&self, job_class: JobClass, units: &[TrackedUnit]) -> Result<TriggerAck> {
        let routes = self.config.endpoints.for_class(job_class);
        let url = self.url(&routes.trigger, None)?;

        let mut builder = self.request(Method::POST, url.clone());
        if job_class.is_multi_unit() {
            let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
            builder = builder.json(&names);
        }

        info!(job_class = %job_class, units = units.len(), url = %url, "Triggering remote job");
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(Call::Trigger, status, &url, &body));
        }

        let ack = parse_ack(&body);
        debug!(job_class = %job_class, status = ?ack.status, message = ?ack.message, "Trigger acknowledged");
        Ok(ack)
    }
}
