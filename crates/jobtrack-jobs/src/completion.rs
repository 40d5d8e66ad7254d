//! Finish predicate for one episode.

use std::collections::{BTreeMap, HashMap, HashSet};

use jobtrack_core::{ProgressSnapshot, TerminalMarkers, TrackedUnit, UnitObservation, UnitOutcome};

/// Decide whether an episode is over.
///
/// Every unit must either have a terminal last snapshot, or have reported
/// "not started" at least `age_out_limit` times in a row. A terminal snapshot
/// wins over the counter, so a unit whose record was cleaned up after it
/// finished still counts as completed. Returns `None` while any unit is
/// still pending; `age_out_limit = None` disables ageing out.
pub fn evaluate(
    units: &[TrackedUnit],
    snapshots: &BTreeMap<u64, ProgressSnapshot>,
    not_started: &HashMap<u64, u32>,
    age_out_limit: Option<u32>,
    markers: &TerminalMarkers,
) -> Option<BTreeMap<u64, UnitOutcome>> {
    if units.is_empty() {
        return None;
    }

    let mut outcomes = BTreeMap::new();
    for unit in units {
        let outcome = match snapshots.get(&unit.id) {
            Some(s) if s.is_terminal(markers) && s.is_failed() => UnitOutcome::Failed,
            Some(s) if s.is_terminal(markers) => UnitOutcome::Completed,
            _ => {
                let misses = not_started.get(&unit.id).copied().unwrap_or(0);
                match age_out_limit {
                    Some(limit) if misses >= limit => UnitOutcome::AgedOut,
                    _ => return None,
                }
            }
        };
        outcomes.insert(unit.id, outcome);
    }
    Some(outcomes)
}

/// Units still running on this tick.
///
/// A unit is running when it reports a non-terminal snapshot, or when its
/// query failed and its last known snapshot is non-terminal. Units run one
/// after another on the remote side, so a unit that has not started while a
/// sibling is running is queued rather than missing.
pub fn progressing(
    units: &[TrackedUnit],
    observations: &[(u64, UnitObservation)],
    snapshots: &BTreeMap<u64, ProgressSnapshot>,
    markers: &TerminalMarkers,
) -> HashSet<u64> {
    let running = |s: &ProgressSnapshot| !s.is_terminal(markers);
    observations
        .iter()
        .filter(|(id, _)| units.iter().any(|u| u.id == *id))
        .filter(|(id, observation)| match observation {
            UnitObservation::Snapshot(s) => running(s),
            UnitObservation::Transient(_) | UnitObservation::Malformed(_) => {
                snapshots.get(id).is_some_and(running)
            }
            UnitObservation::NotStarted | UnitObservation::Fatal(_) => false,
        })
        .map(|(id, _)| *id)
        .collect()
}
