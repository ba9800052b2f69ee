use crate::error::EngineError;
use crate::spec::{TaskId, Timestamp, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Work item lifecycle.
///
/// `Enabled -> Fired -> Executing -> Complete`, with `Cancelled` reachable
/// from any live state and `Failed` from `Executing`. All other
/// transitions are invariant violations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItemState {
    /// Created by a task enablement, offered to the worklist, not claimed.
    Enabled,
    /// Claimed: the firing has consumed its join tokens.
    Fired,
    /// In progress at an external executor.
    Executing,
    Complete,
    Cancelled,
    Failed,
}

impl WorkItemState {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkItemState::Enabled | WorkItemState::Fired | WorkItemState::Executing
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }

    fn can_transition_to(&self, next: &WorkItemState) -> bool {
        use WorkItemState::*;
        matches!(
            (self, next),
            (Enabled, Fired)
                | (Fired, Executing)
                | (Executing, Complete)
                | (Enabled, Cancelled)
                | (Fired, Cancelled)
                | (Executing, Cancelled)
                | (Executing, Failed)
        )
    }
}

/// A runtime instance of a fired task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub task: TaskId,
    pub case_id: Uuid,
    pub state: WorkItemState,
    /// Parent item for multiple-instance children.
    pub parent: Option<Uuid>,
    pub created_at: Timestamp,
    /// Canonical JSON of the case flags at creation time.
    pub data_snapshot: String,
    /// SHA-256 of `data_snapshot`.
    pub data_hash: [u8; 32],
}

impl WorkItem {
    pub fn transition(&mut self, next: WorkItemState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(&next) {
            return Err(EngineError::invariant(format!(
                "work item {}: illegal transition {:?} -> {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

pub fn snapshot_hash(data: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.finalize().into()
}

/// The set of work items belonging to one case.
///
/// Terminal items are retained for queryability; `live_*` accessors filter
/// them out. Owned exclusively by the case's runner.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkItemSet {
    items: BTreeMap<Uuid, WorkItem>,
}

impl WorkItemSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<WorkItem>) -> Self {
        Self {
            items: items.into_iter().map(|i| (i.id, i)).collect(),
        }
    }

    pub fn get(&self, id: Uuid) -> Result<&WorkItem, EngineError> {
        self.items.get(&id).ok_or(EngineError::UnknownWorkItem(id))
    }

    pub fn get_mut(&mut self, id: Uuid) -> Result<&mut WorkItem, EngineError> {
        self.items
            .get_mut(&id)
            .ok_or(EngineError::UnknownWorkItem(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }

    pub fn live(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values().filter(|i| i.state.is_live())
    }

    /// Tasks that currently have at least one live item.
    pub fn live_tasks(&self) -> BTreeSet<TaskId> {
        self.live().map(|i| i.task).collect()
    }

    pub fn live_of_task(&self, task: TaskId) -> Vec<Uuid> {
        self.live()
            .filter(|i| i.task == task)
            .map(|i| i.id)
            .collect()
    }

    pub fn live_children(&self, parent: Uuid) -> Vec<Uuid> {
        self.live()
            .filter(|i| i.parent == Some(parent))
            .map(|i| i.id)
            .collect()
    }

    pub fn completed_children(&self, parent: Uuid) -> usize {
        self.items
            .values()
            .filter(|i| i.parent == Some(parent) && i.state == WorkItemState::Complete)
            .count()
    }

    /// Create one `Enabled` item for the task with a snapshot of the case
    /// flags. Returns the new item's id.
    pub fn spawn(
        &mut self,
        case_id: Uuid,
        task: TaskId,
        parent: Option<Uuid>,
        flags: &BTreeMap<String, Value>,
        now: Timestamp,
    ) -> Uuid {
        let data_snapshot =
            serde_json::to_string(flags).unwrap_or_else(|_| String::from("{}"));
        let data_hash = snapshot_hash(&data_snapshot);
        let id = Uuid::now_v7();
        self.items.insert(
            id,
            WorkItem {
                id,
                task,
                case_id,
                state: WorkItemState::Enabled,
                parent,
                created_at: now,
                data_snapshot,
                data_hash,
            },
        );
        id
    }

    pub fn into_items(self) -> Vec<WorkItem> {
        self.items.into_values().collect()
    }
}
