//! Operator verdicts on possibly-conflicting pairs of units.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::unit::UnitId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The pair is independent and may run concurrently.
    Parallelize,
    /// The flagged unit waits for the other to finish.
    Serialize,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Parallelize => "parallelize",
            Verdict::Serialize => "serialize",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "parallelize" => Ok(Verdict::Parallelize),
            "serialize" => Ok(Verdict::Serialize),
            other => Err(Error::Validation(format!("unknown verdict: {other}"))),
        }
    }
}

/// An unordered pair of distinct units, stored smallest id first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitPair {
    pub first: UnitId,
    pub second: UnitId,
}

impl UnitPair {
    pub fn new(a: UnitId, b: UnitId) -> Result<Self> {
        if a == b {
            return Err(Error::Validation(format!("a unit cannot pair with itself: {a}")));
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { first, second })
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        &self.first == id || &self.second == id
    }
}

/// Recorded verdicts, keyed by pair.
#[derive(Debug, Clone, Default)]
pub struct VerdictBook {
    verdicts: HashMap<UnitPair, Verdict>,
}

impl VerdictBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins.
    pub fn insert(&mut self, pair: UnitPair, verdict: Verdict) {
        self.verdicts.insert(pair, verdict);
    }

    pub fn get(&self, a: &UnitId, b: &UnitId) -> Option<Verdict> {
        let pair = UnitPair::new(a.clone(), b.clone()).ok()?;
        self.verdicts.get(&pair).copied()
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}
