use crate::events::Announcement;
use crate::store::{CaseSnapshot, CaseStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// In-memory reference implementation of `CaseStore`.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<Uuid, CaseSnapshot>>,
    events: Mutex<HashMap<Uuid, Vec<Announcement>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn save_snapshot(&self, snapshot: &CaseSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.case_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, case_id: Uuid) -> Result<Option<CaseSnapshot>> {
        Ok(self.snapshots.lock().unwrap().get(&case_id).cloned())
    }

    async fn delete_case(&self, case_id: Uuid) -> Result<()> {
        self.snapshots.lock().unwrap().remove(&case_id);
        self.events.lock().unwrap().remove(&case_id);
        Ok(())
    }

    async fn append_event(&self, case_id: Uuid, event: &Announcement) -> Result<u64> {
        let mut events = self.events.lock().unwrap();
        let log = events.entry(case_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(
        &self,
        case_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, Announcement)>> {
        let events = self.events.lock().unwrap();
        Ok(events
            .get(&case_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .filter(|(seq, _)| *seq >= from_seq)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Test wrapper that fails the next `n` snapshot writes, for exercising
/// the rollback-and-retry path of the transition loop.
pub struct FlakyStore {
    inner: MemoryStore,
    failures_remaining: AtomicU32,
}

impl FlakyStore {
    pub fn failing_next(n: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_remaining: AtomicU32::new(n),
        }
    }

    pub fn arm(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaseStore for FlakyStore {
    async fn save_snapshot(&self, snapshot: &CaseSnapshot) -> Result<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("injected snapshot failure"));
        }
        self.inner.save_snapshot(snapshot).await
    }

    async fn load_snapshot(&self, case_id: Uuid) -> Result<Option<CaseSnapshot>> {
        self.inner.load_snapshot(case_id).await
    }

    async fn delete_case(&self, case_id: Uuid) -> Result<()> {
        self.inner.delete_case(case_id).await
    }

    async fn append_event(&self, case_id: Uuid, event: &Announcement) -> Result<u64> {
        self.inner.append_event(case_id, event).await
    }

    async fn read_events(
        &self,
        case_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, Announcement)>> {
        self.inner.read_events(case_id, from_seq).await
    }
}
