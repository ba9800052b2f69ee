use crate::events::Announcement;
use crate::marking::Marking;
use crate::runner::CaseState;
use crate::spec::Value;
use crate::workitem::WorkItem;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Everything needed to resume a case's transition loop exactly where it
/// left off. Written once per atomic transition unit; a unit is not
/// committed until the write succeeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub case_id: Uuid,
    pub net_name: String,
    pub net_version: u32,
    pub state: CaseState,
    pub marking: Marking,
    pub items: Vec<WorkItem>,
    pub flags: BTreeMap<String, Value>,
}

/// Persistence gateway for case state.
///
/// The runner and coordinator operate exclusively through this trait,
/// enabling pluggable backends (`MemoryStore` for tests and single-node
/// deployments, a database-backed store in production).
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn save_snapshot(&self, snapshot: &CaseSnapshot) -> Result<()>;
    async fn load_snapshot(&self, case_id: Uuid) -> Result<Option<CaseSnapshot>>;
    async fn delete_case(&self, case_id: Uuid) -> Result<()>;

    // ── Audit log (append-only) ──

    /// Append an announcement to the case's audit log; returns its
    /// sequence number.
    async fn append_event(&self, case_id: Uuid, event: &Announcement) -> Result<u64>;
    async fn read_events(&self, case_id: Uuid, from_seq: u64)
        -> Result<Vec<(u64, Announcement)>>;
}
