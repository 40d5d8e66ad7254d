//! Domain models for job tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::TerminalMarkers;
use crate::error::{Error, Result};

// =============================================================================
// JOB CLASSES AND UNITS
// =============================================================================

/// An independently tracked category of long-running remote work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobClass {
    /// Scraping of one or more sites; one tracked unit per site.
    #[serde(rename = "scrape")]
    SiteScrape,
    /// Normalization and vectorization of scraped documents.
    #[serde(rename = "vectorization")]
    DocumentVectorization,
    /// Vectorization of the uploaded PDF corpus.
    #[serde(rename = "corpus_vectorization")]
    CorpusVectorization,
}

impl JobClass {
    /// Every job class, in a stable order.
    pub const ALL: [JobClass; 3] = [
        JobClass::SiteScrape,
        JobClass::DocumentVectorization,
        JobClass::CorpusVectorization,
    ];

    /// Short, stable name used in storage keys, logs and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::SiteScrape => "scrape",
            JobClass::DocumentVectorization => "vectorization",
            JobClass::CorpusVectorization => "corpus_vectorization",
        }
    }

    /// Whether the class tracks several units (sites) per run.
    pub fn is_multi_unit(&self) -> bool {
        matches!(self, JobClass::SiteScrape)
    }

    /// Dense index, used for per-class fixed-size tables.
    pub fn index(&self) -> usize {
        match self {
            JobClass::SiteScrape => 0,
            JobClass::DocumentVectorization => 1,
            JobClass::CorpusVectorization => 2,
        }
    }

    /// Normalize caller-provided units for this class.
    ///
    /// Single-unit classes always track their implicit unit. Multi-unit classes
    /// need at least one unit and unique unit ids.
    pub fn normalize_units(&self, units: Vec<TrackedUnit>) -> Result<Vec<TrackedUnit>> {
        if !self.is_multi_unit() {
            return Ok(vec![TrackedUnit::implicit(*self)]);
        }
        if units.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} needs at least one unit",
                self
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for unit in &units {
            if !seen.insert(unit.id) {
                return Err(Error::InvalidInput(format!(
                    "duplicate unit id {} for {}",
                    unit.id, self
                )));
            }
        }
        Ok(units)
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "scrape" | "scraping" => Ok(JobClass::SiteScrape),
            "vectorization" | "vectorisation" => Ok(JobClass::DocumentVectorization),
            "corpus_vectorization" | "corpus" => Ok(JobClass::CorpusVectorization),
            _ => Err(Error::InvalidInput(format!("unknown job class: {s}"))),
        }
    }
}

/// One individually progress-tracked item within a job class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedUnit {
    /// Locally assigned numeric id.
    pub id: u64,
    /// Display name (the site name for scrapes).
    pub name: String,
}

impl TrackedUnit {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The single implicit unit of a single-unit class.
    pub fn implicit(job_class: JobClass) -> Self {
        Self::new(0, job_class.as_str())
    }
}

// =============================================================================
// PROGRESS
// =============================================================================

/// Structured phase reported by backends that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Pending,
    Running,
    Done,
    Error,
}

impl FromStr for ProgressPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ProgressPhase::Pending),
            "running" => Ok(ProgressPhase::Running),
            "done" => Ok(ProgressPhase::Done),
            "error" => Ok(ProgressPhase::Error),
            _ => Err(Error::InvalidInput(format!("unknown progress phase: {s}"))),
        }
    }
}

/// The `{current, total, status}` triple reported for one unit.
///
/// `current <= total` is expected but not guaranteed by the backend; nothing
/// here assumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub total: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProgressPhase>,
}

impl ProgressSnapshot {
    pub fn new(current: u64, total: u64, status: impl Into<String>) -> Self {
        Self {
            current,
            total,
            status: status.into(),
            phase: None,
        }
    }

    pub fn with_phase(mut self, phase: ProgressPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Whether this unit has reached a terminal state.
    ///
    /// A structured `phase` wins when present. Otherwise the status must match
    /// a terminal marker and the counter must have reached the total.
    pub fn is_terminal(&self, markers: &TerminalMarkers) -> bool {
        match self.phase {
            Some(ProgressPhase::Done) | Some(ProgressPhase::Error) => true,
            Some(ProgressPhase::Pending) | Some(ProgressPhase::Running) => false,
            None => self.current >= self.total && markers.matches(&self.status),
        }
    }

    /// Whether the backend reported the unit as failed.
    pub fn is_failed(&self) -> bool {
        self.phase == Some(ProgressPhase::Error)
    }

    /// Completion ratio clamped to `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// A successfully decoded remote progress response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressReading {
    Snapshot(ProgressSnapshot),
    /// No progress record exists (not created yet, or already cleaned up).
    NotStarted,
}

/// What one polling tick learned about one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitObservation {
    Snapshot(ProgressSnapshot),
    NotStarted,
    /// Payload could not be decoded; retried next tick.
    Malformed(String),
    /// Network or server fault; retried next tick.
    Transient(String),
    /// Permanent failure; stops the job class.
    Fatal(String),
}

impl UnitObservation {
    /// Classify the outcome of one remote progress query.
    pub fn from_query(result: Result<ProgressReading>) -> Self {
        match result {
            Ok(ProgressReading::Snapshot(snapshot)) => UnitObservation::Snapshot(snapshot),
            Ok(ProgressReading::NotStarted) => UnitObservation::NotStarted,
            Err(e) if e.is_fatal() => UnitObservation::Fatal(e.to_string()),
            Err(Error::Serialization(msg)) => UnitObservation::Malformed(msg),
            Err(e) => UnitObservation::Transient(e.to_string()),
        }
    }
}

/// Acknowledgement returned by the remote trigger call.
///
/// It only means the job was accepted, not that it completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerAck {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Durable subset of coordinator state needed to recover after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub active: bool,
    pub job_class: JobClass,
    pub unit_names: Vec<String>,
    pub unit_ids: Vec<u64>,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
}

impl PersistedRecord {
    /// Build the active record for a run over `units`.
    pub fn active(job_class: JobClass, units: &[TrackedUnit]) -> Self {
        Self {
            active: true,
            job_class,
            unit_names: units.iter().map(|u| u.name.clone()).collect(),
            unit_ids: units.iter().map(|u| u.id).collect(),
            started_at: Utc::now(),
        }
    }

    /// Reassemble the tracked units.
    pub fn units(&self) -> Result<Vec<TrackedUnit>> {
        if self.unit_names.len() != self.unit_ids.len() {
            return Err(Error::InvalidInput(format!(
                "record for {} has {} names but {} ids",
                self.job_class,
                self.unit_names.len(),
                self.unit_ids.len()
            )));
        }
        Ok(self
            .unit_ids
            .iter()
            .zip(&self.unit_names)
            .map(|(id, name)| TrackedUnit::new(*id, name.clone()))
            .collect())
    }
}

// =============================================================================
// COORDINATOR VIEW
// =============================================================================

/// Lifecycle phase of one job class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorPhase {
    Idle,
    /// Start accepted, waiting for the remote trigger acknowledgement.
    Starting,
    Running,
    Finishing,
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinatorPhase::Idle => "idle",
            CoordinatorPhase::Starting => "starting",
            CoordinatorPhase::Running => "running",
            CoordinatorPhase::Finishing => "finishing",
        };
        f.write_str(s)
    }
}

/// Read-only view of one job class, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub job_class: JobClass,
    pub phase: CoordinatorPhase,
    pub running: bool,
    pub episode_id: Option<Uuid>,
    pub units: Vec<TrackedUnit>,
    pub snapshots: BTreeMap<u64, ProgressSnapshot>,
    pub ticks: u64,
    pub recovered: bool,
    pub last_error: Option<String>,
}

impl CoordinatorStatus {
    /// Status of a class with nothing in flight.
    pub fn idle(job_class: JobClass) -> Self {
        Self {
            job_class,
            phase: CoordinatorPhase::Idle,
            running: false,
            episode_id: None,
            units: Vec::new(),
            snapshots: BTreeMap::new(),
            ticks: 0,
            recovered: false,
            last_error: None,
        }
    }
}

/// How a unit ended when its episode finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed,
    Failed,
    /// Never (or no longer) reported progress within the allowed ticks.
    AgedOut,
}

/// Final state of an episode, handed to finish callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishReport {
    pub job_class: JobClass,
    pub episode_id: Uuid,
    pub units: Vec<TrackedUnit>,
    pub snapshots: BTreeMap<u64, ProgressSnapshot>,
    pub outcomes: BTreeMap<u64, UnitOutcome>,
    pub recovered: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FinishReport {
    /// Units that did not complete successfully.
    pub fn incomplete_units(&self) -> Vec<&TrackedUnit> {
        self.units
            .iter()
            .filter(|u| self.outcomes.get(&u.id) != Some(&UnitOutcome::Completed))
            .collect()
    }
}
