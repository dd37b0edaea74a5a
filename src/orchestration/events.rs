//! Change notifications for API subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::{Phase, UnitId, UnitStatus, WorkUnit};

/// Compact view of a unit, without its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub id: UnitId,
    pub phase: Phase,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attention_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub blocked_by: Vec<UnitId>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub conflicts_with: Vec<UnitId>,
    pub completion_retries: u32,
    pub priority: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkUnit> for UnitSummary {
    fn from(unit: &WorkUnit) -> Self {
        Self {
            id: unit.id.clone(),
            phase: unit.phase,
            status: unit.status,
            attention_reason: unit.attention_reason.clone(),
            blocked_by: unit.blocked_by.iter().cloned().collect(),
            conflicts_with: unit.conflicts_with.iter().cloned().collect(),
            completion_retries: unit.completion_retries,
            priority: unit.priority,
            updated_at: unit.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitEvent {
    Created {
        unit: UnitSummary,
    },
    /// Status or phase changed.
    Transitioned {
        unit: UnitSummary,
        from_status: UnitStatus,
        from_phase: Phase,
    },
    /// Fields changed without a transition (retry counter, session).
    Updated {
        unit: UnitSummary,
    },
    /// The attention queue gained or lost this unit.
    AttentionChanged {
        unit_id: UnitId,
        needs_attention: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Deleted {
        unit_id: UnitId,
    },
}

impl UnitEvent {
    pub fn unit_id(&self) -> &UnitId {
        match self {
            UnitEvent::Created { unit }
            | UnitEvent::Transitioned { unit, .. }
            | UnitEvent::Updated { unit } => &unit.id,
            UnitEvent::AttentionChanged { unit_id, .. } | UnitEvent::Deleted { unit_id } => unit_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnitEvent::Created { .. } => "created",
            UnitEvent::Transitioned { .. } => "transitioned",
            UnitEvent::Updated { .. } => "updated",
            UnitEvent::AttentionChanged { .. } => "attention_changed",
            UnitEvent::Deleted { .. } => "deleted",
        }
    }
}

/// Events describing how `unit` changed from the given status and phase.
pub fn changes(from_status: UnitStatus, from_phase: Phase, unit: &WorkUnit) -> Vec<UnitEvent> {
    let summary = UnitSummary::from(unit);
    if from_status == unit.status && from_phase == unit.phase {
        return vec![UnitEvent::Updated { unit: summary }];
    }
    let mut events = vec![UnitEvent::Transitioned {
        unit: summary,
        from_status,
        from_phase,
    }];
    let was = from_status == UnitStatus::NeedsAttention;
    let is = unit.status == UnitStatus::NeedsAttention;
    if was != is {
        events.push(UnitEvent::AttentionChanged {
            unit_id: unit.id.clone(),
            needs_attention: is,
            reason: unit.attention_reason.clone(),
        });
    }
    events
}

/// Fan-out of [`UnitEvent`]s. Publishing never blocks and never fails;
/// slow subscribers lag and skip.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UnitEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: UnitEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = UnitEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
