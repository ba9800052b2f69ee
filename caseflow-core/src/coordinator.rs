use crate::error::EngineError;
use crate::events::{Announcement, CaseEvent};
use crate::runner::NetRunner;
use crate::spec::{Net, Value};
use crate::store::{CaseSnapshot, CaseStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

struct CaseHandle {
    // Serializes all events of one case; cases never share a lock.
    runner: Mutex<NetRunner>,
}

/// Multiplexes many concurrent cases over one store and one announcement
/// stream. Events for the same case apply strictly in submission order;
/// events for different cases proceed in parallel.
pub struct CaseCoordinator {
    store: Arc<dyn CaseStore>,
    nets: Mutex<HashMap<String, Arc<Net>>>,
    cases: Mutex<HashMap<Uuid, Arc<CaseHandle>>>,
    tx: mpsc::UnboundedSender<Announcement>,
}

impl CaseCoordinator {
    /// Returns the coordinator and the announcement stream feeding the
    /// worklist, timer and exception-handling collaborators.
    pub fn new(store: Arc<dyn CaseStore>) -> (Self, mpsc::UnboundedReceiver<Announcement>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                nets: Mutex::new(HashMap::new()),
                cases: Mutex::new(HashMap::new()),
                tx,
            },
            rx,
        )
    }

    /// Make a validated net available for launching, keyed by name.
    pub async fn register_net(&self, net: Net) {
        info!(net = %net.name, version = net.version, "net registered");
        self.nets.lock().await.insert(net.name.clone(), Arc::new(net));
    }

    async fn net_by_name(&self, name: &str) -> Result<Arc<Net>, EngineError> {
        self.nets
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNet(name.to_string()))
    }

    /// Start a new case of a registered net. Returns the case id once the
    /// initial snapshot is durable.
    pub async fn launch(
        &self,
        net_name: &str,
        flags: BTreeMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let net = self.net_by_name(net_name).await?;
        let case_id = Uuid::now_v7();
        let runner = NetRunner::launch(
            case_id,
            net,
            flags,
            self.store.clone(),
            self.tx.clone(),
        )
        .await?;
        self.cases.lock().await.insert(
            case_id,
            Arc::new(CaseHandle {
                runner: Mutex::new(runner),
            }),
        );
        Ok(case_id)
    }

    /// Route one event to its case. Holds only the per-case lock while
    /// processing, so distinct cases advance concurrently.
    pub async fn submit(&self, case_id: Uuid, event: CaseEvent) -> Result<(), EngineError> {
        let handle = self.handle_for(case_id).await?;
        let mut runner = handle.runner.lock().await;
        runner.handle(event).await
    }

    pub async fn cancel_case(&self, case_id: Uuid) -> Result<(), EngineError> {
        self.submit(case_id, CaseEvent::CancelCase).await
    }

    /// Queryable view of a case, including suspended and terminal ones.
    pub async fn case_view(&self, case_id: Uuid) -> Result<CaseSnapshot, EngineError> {
        let handle = self.handle_for(case_id).await?;
        let runner = handle.runner.lock().await;
        Ok(runner.view())
    }

    /// Rebuild a case from its persisted snapshot after a restart. The
    /// case's net must already be registered. A case that is still live in
    /// memory is not replaced: its runner state would be discarded.
    pub async fn recover_case(&self, case_id: Uuid) -> Result<(), EngineError> {
        let existing = self.cases.lock().await.get(&case_id).cloned();
        if let Some(handle) = existing {
            if !handle.runner.lock().await.state().is_terminal() {
                return Err(EngineError::invariant(format!(
                    "case {case_id} is still live in memory, refusing to recover over it"
                )));
            }
        }
        let snapshot = self
            .store
            .load_snapshot(case_id)
            .await
            .map_err(|err| EngineError::Persistence(err.to_string()))?
            .ok_or(EngineError::UnknownCase(case_id))?;
        let net = self.net_by_name(&snapshot.net_name).await?;
        if net.version != snapshot.net_version {
            warn!(
                case = %case_id,
                snapshot_version = snapshot.net_version,
                registered_version = net.version,
                "recovering case against a different net version"
            );
        }
        let runner = NetRunner::recover(snapshot, net, self.store.clone(), self.tx.clone());
        self.cases.lock().await.insert(
            case_id,
            Arc::new(CaseHandle {
                runner: Mutex::new(runner),
            }),
        );
        info!(case = %case_id, "case recovered");
        Ok(())
    }

    /// Drop a terminal case from the in-memory table and erase its
    /// persisted state. Refuses while the case is still live.
    pub async fn purge_case(&self, case_id: Uuid) -> Result<(), EngineError> {
        let handle = self.handle_for(case_id).await?;
        {
            let runner = handle.runner.lock().await;
            if !runner.state().is_terminal() {
                return Err(EngineError::CaseNotActive(case_id));
            }
        }
        self.cases.lock().await.remove(&case_id);
        self.store
            .delete_case(case_id)
            .await
            .map_err(|err| EngineError::Persistence(err.to_string()))?;
        Ok(())
    }

    pub async fn known_cases(&self) -> Vec<Uuid> {
        self.cases.lock().await.keys().copied().collect()
    }

    async fn handle_for(&self, case_id: Uuid) -> Result<Arc<CaseHandle>, EngineError> {
        self.cases
            .lock()
            .await
            .get(&case_id)
            .cloned()
            .ok_or(EngineError::UnknownCase(case_id))
    }
}
