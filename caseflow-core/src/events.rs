use crate::spec::{TaskId, Timestamp, Value};
use crate::workitem::WorkItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// External events routed into a case's runner. Events for one case are
/// applied strictly in submission order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CaseEvent {
    /// A worklist actor claims an enabled item and begins execution.
    StartWorkItem { item: Uuid },
    /// An executor reports completion; `flags` merge into the case flags.
    CompleteWorkItem {
        item: Uuid,
        flags: BTreeMap<String, Value>,
    },
    CancelWorkItem { item: Uuid },
    /// An executor reports failure. The case stays running pending an
    /// external decision (retry, compensate, force-cancel).
    FailWorkItem { item: Uuid, reason: String },
    /// Injected by the external timer service at a scheduled deadline.
    TimerFired { item: Uuid },
    SuspendCase,
    ResumeCase,
    CancelCase,
}

/// Outward announcements — the durable audit trail, and the feed for the
/// worklist, exception-handling and timer collaborators. Delivery is
/// fire-and-forget; it never blocks the transition loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Announcement {
    CaseStarted {
        case_id: Uuid,
        net_name: String,
    },
    CaseCompleted {
        case_id: Uuid,
        at: Timestamp,
    },
    CaseCancelled {
        case_id: Uuid,
        at: Timestamp,
    },
    CaseSuspended {
        case_id: Uuid,
    },
    CaseResumed {
        case_id: Uuid,
    },
    /// The case hit a fatal fault and was parked for an operator or the
    /// exception-handling collaborator to resolve.
    CaseFaulted {
        case_id: Uuid,
        fault: String,
    },
    /// A new item is available to the worklist layer.
    ItemEnabled {
        item: WorkItem,
    },
    ItemStarted {
        case_id: Uuid,
        item: Uuid,
        task: TaskId,
    },
    ItemCompleted {
        case_id: Uuid,
        item: Uuid,
        task: TaskId,
    },
    ItemCancelled {
        case_id: Uuid,
        item: Uuid,
        task: TaskId,
    },
    /// Routed to the exception-handling collaborator.
    ItemFailed {
        case_id: Uuid,
        item: Uuid,
        task: TaskId,
        reason: String,
    },
    /// Request to the external timer service; it calls back with
    /// `CaseEvent::TimerFired` at the deadline.
    ScheduleTimer {
        case_id: Uuid,
        item: Uuid,
        fire_at: Timestamp,
    },
}

impl Announcement {
    pub fn case_id(&self) -> Uuid {
        match self {
            Announcement::CaseStarted { case_id, .. }
            | Announcement::CaseCompleted { case_id, .. }
            | Announcement::CaseCancelled { case_id, .. }
            | Announcement::CaseSuspended { case_id }
            | Announcement::CaseResumed { case_id }
            | Announcement::CaseFaulted { case_id, .. }
            | Announcement::ItemStarted { case_id, .. }
            | Announcement::ItemCompleted { case_id, .. }
            | Announcement::ItemCancelled { case_id, .. }
            | Announcement::ItemFailed { case_id, .. }
            | Announcement::ScheduleTimer { case_id, .. } => *case_id,
            Announcement::ItemEnabled { item } => item.case_id,
        }
    }
}
