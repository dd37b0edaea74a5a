//! Conflict oracle.
//!
//! Decides whether a READY unit may run alongside the units already
//! RUNNING. It is conservative: overlapping footprints, or a footprint
//! nobody declared, count as a possible conflict unless an operator
//! verdict says otherwise.

use std::collections::BTreeSet;

use crate::core::{UnitId, Verdict, VerdictBook, WorkUnit};

/// Overlap marker used when a unit declared no footprint.
pub const UNDECLARED: &str = "<undeclared footprint>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    /// Safe to dispatch now.
    Clear,
    /// Operator said to serialize with these running units.
    Wait { on: BTreeSet<UnitId> },
    /// Possible conflict nobody has ruled on.
    Conflict {
        with: BTreeSet<UnitId>,
        overlap: BTreeSet<String>,
    },
}

/// Strip `./` prefixes, duplicate and trailing slashes.
pub fn normalize_path(path: &str) -> String {
    path.trim()
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// True when one path is the other or a directory containing it.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = normalize_path(a);
    let b = normalize_path(b);
    if a.is_empty() || b.is_empty() {
        // The repository root contains everything.
        return true;
    }
    let within = |inner: &str, outer: &str| {
        inner == outer
            || inner
                .strip_prefix(outer)
                .is_some_and(|rest| rest.starts_with('/'))
    };
    within(&a, &b) || within(&b, &a)
}

/// Overlapping entries of two footprints. An empty footprint overlaps
/// everything.
pub fn footprint_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    if a.is_empty() || b.is_empty() {
        return BTreeSet::from([UNDECLARED.to_string()]);
    }
    let mut overlap = BTreeSet::new();
    for x in a {
        for y in b {
            if paths_overlap(x, y) {
                // Report the narrower path.
                let narrower = if normalize_path(x).len() >= normalize_path(y).len() {
                    x
                } else {
                    y
                };
                overlap.insert(normalize_path(narrower));
            }
        }
    }
    overlap
}

/// Assess `candidate` against `running`.
///
/// A `parallelize` verdict clears a pair; a `serialize` verdict turns it
/// into a wait. Any unruled overlap makes the whole assessment a
/// conflict, since the operator has to look at it anyway.
pub fn check_conflict(candidate: &WorkUnit, running: &[WorkUnit], verdicts: &VerdictBook) -> Assessment {
    let mut wait_on = BTreeSet::new();
    let mut conflict_with = BTreeSet::new();
    let mut overlap = BTreeSet::new();

    for other in running.iter().filter(|u| u.id != candidate.id) {
        let shared = footprint_overlap(&candidate.footprint, &other.footprint);
        if shared.is_empty() {
            continue;
        }
        match verdicts.get(&candidate.id, &other.id) {
            Some(Verdict::Parallelize) => {}
            Some(Verdict::Serialize) => {
                wait_on.insert(other.id.clone());
            }
            None => {
                conflict_with.insert(other.id.clone());
                overlap.extend(shared);
            }
        }
    }

    if !conflict_with.is_empty() {
        Assessment::Conflict {
            with: conflict_with,
            overlap,
        }
    } else if !wait_on.is_empty() {
        Assessment::Wait { on: wait_on }
    } else {
        Assessment::Clear
    }
}

/// Human-readable attention reason for a conflict.
pub fn conflict_reason(with: &BTreeSet<UnitId>, overlap: &BTreeSet<String>) -> String {
    let units: Vec<&str> = with.iter().map(UnitId::as_str).collect();
    let paths: Vec<&str> = overlap.iter().map(String::as_str).collect();
    format!(
        "possible conflict with running {}: overlapping {}; submit a parallelize or serialize verdict",
        units.join(", "),
        paths.join(", ")
    )
}
