//! Request and response bodies shared by the server and the CLI client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{Phase, UnitId, UnitStatus, Verdict, WorkUnit};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub counts: BTreeMap<UnitStatus, usize>,
    pub max_agents: usize,
}

impl StatusReport {
    pub fn running_agents(&self) -> usize {
        self.counts.get(&UnitStatus::Running).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUnitRequest {
    pub id: String,
    /// Declared footprint; read from the unit's goal document when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footprint: Option<Vec<String>>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictRequest {
    pub verdict: Verdict,
}

/// One entry of the attention queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionItem {
    pub id: UnitId,
    pub phase: Phase,
    pub reason: String,
    /// Conflict partners, if the reason is a possible conflict.
    #[serde(default)]
    pub related: Vec<UnitId>,
    pub since: DateTime<Utc>,
}

impl AttentionItem {
    pub fn from_unit(unit: &WorkUnit) -> Option<Self> {
        if unit.status != UnitStatus::NeedsAttention {
            return None;
        }
        Some(Self {
            id: unit.id.clone(),
            phase: unit.phase,
            reason: unit.attention_reason.clone().unwrap_or_default(),
            related: unit.related_units().into_iter().collect(),
            since: unit.updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_counts_serialize_by_status_name() {
        let report = StatusReport {
            pid: 1,
            started_at: Utc::now(),
            uptime_secs: 3,
            counts: UnitStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
            max_agents: 4,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["counts"]["NEEDS_ATTENTION"], 0);
        assert_eq!(report.running_agents(), 0);
    }

    #[test]
    fn test_attention_item_only_for_flagged_units() {
        let mut unit = WorkUnit::new(UnitId::new("b").unwrap(), BTreeSet::new());
        assert!(AttentionItem::from_unit(&unit).is_none());
        unit.flag_conflict("overlap on x.py", BTreeSet::from([UnitId::new("a").unwrap()]))
            .unwrap();
        let item = AttentionItem::from_unit(&unit).unwrap();
        assert_eq!(item.reason, "overlap on x.py");
        assert_eq!(item.related, vec![UnitId::new("a").unwrap()]);
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateUnitRequest = serde_json::from_str(r#"{"id":"a"}"#).unwrap();
        assert_eq!(req.priority, 0);
        assert!(req.footprint.is_none());
    }
}
