use crate::enablement::{enabled_tasks, join_satisfied};
use crate::error::EngineError;
use crate::events::{Announcement, CaseEvent};
use crate::marking::Marking;
use crate::spec::{JoinKind, Net, NodeRef, SplitKind, TaskId, Timestamp, Value};
use crate::store::{CaseSnapshot, CaseStore};
use crate::workitem::{WorkItemSet, WorkItemState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Case lifecycle state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CaseState {
    Running,
    /// Externally suspended; events queue until resume.
    Suspended,
    /// Parked on a fatal fault; queryable, processes nothing until an
    /// operator or the exception-handling collaborator resumes it.
    SuspendedFault { fault: String },
    Completed { at: Timestamp },
    Cancelled { at: Timestamp },
}

impl CaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseState::Completed { .. } | CaseState::Cancelled { .. })
    }
}

pub(crate) fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Pre-unit state held for rollback.
struct Checkpoint {
    state: CaseState,
    marking: Marking,
    items: WorkItemSet,
    flags: BTreeMap<String, Value>,
}

/// The per-case engine. Owns the marking and live work item set of one
/// case and advances it one external event at a time.
///
/// Every event is processed as one indivisible unit: apply the event,
/// update the marking, apply cancellation regions, re-evaluate enablement,
/// spawn new items, persist. A unit either commits as a whole (snapshot
/// write succeeded) or leaves the case exactly as it was.
pub struct NetRunner {
    case_id: Uuid,
    net: Arc<Net>,
    state: CaseState,
    marking: Marking,
    items: WorkItemSet,
    flags: BTreeMap<String, Value>,
    store: Arc<dyn CaseStore>,
    announcer: mpsc::UnboundedSender<Announcement>,
    /// Events received while suspended, replayed on resume.
    queued: VecDeque<CaseEvent>,
}

impl NetRunner {
    /// Create a new case: one token on the start condition, initial
    /// enablement evaluated, first snapshot persisted.
    pub async fn launch(
        case_id: Uuid,
        net: Arc<Net>,
        flags: BTreeMap<String, Value>,
        store: Arc<dyn CaseStore>,
        announcer: mpsc::UnboundedSender<Announcement>,
    ) -> Result<Self, EngineError> {
        let mut marking = Marking::new();
        marking.produce(net.start());

        let mut runner = Self {
            case_id,
            net: net.clone(),
            state: CaseState::Running,
            marking,
            items: WorkItemSet::new(),
            flags,
            store,
            announcer,
            queued: VecDeque::new(),
        };

        let mut pending = vec![Announcement::CaseStarted {
            case_id,
            net_name: net.name.clone(),
        }];
        runner.reconcile(&mut pending)?;
        runner.persist_with_retry().await?;
        runner.flush(pending).await;
        info!(case = %case_id, net = %net.name, "case launched");
        Ok(runner)
    }

    /// Rebuild a runner from a persisted snapshot (crash recovery).
    pub fn recover(
        snapshot: CaseSnapshot,
        net: Arc<Net>,
        store: Arc<dyn CaseStore>,
        announcer: mpsc::UnboundedSender<Announcement>,
    ) -> Self {
        Self {
            case_id: snapshot.case_id,
            net,
            state: snapshot.state,
            marking: snapshot.marking,
            items: WorkItemSet::from_items(snapshot.items),
            flags: snapshot.flags,
            store,
            announcer,
            queued: VecDeque::new(),
        }
    }

    pub fn case_id(&self) -> Uuid {
        self.case_id
    }

    pub fn state(&self) -> &CaseState {
        &self.state
    }

    /// Queryable view of the case, valid even while suspended or faulted.
    pub fn view(&self) -> CaseSnapshot {
        CaseSnapshot {
            case_id: self.case_id,
            net_name: self.net.name.clone(),
            net_version: self.net.version,
            state: self.state.clone(),
            marking: self.marking.clone(),
            items: self.items.iter().cloned().collect(),
            flags: self.flags.clone(),
        }
    }

    /// Route one external event through the case. Events arriving while
    /// suspended are queued; cancellation is always processed and is
    /// idempotent.
    pub async fn handle(&mut self, event: CaseEvent) -> Result<(), EngineError> {
        if self.state.is_terminal() {
            return if matches!(event, CaseEvent::CancelCase) {
                Ok(())
            } else {
                Err(EngineError::CaseNotActive(self.case_id))
            };
        }
        if !matches!(self.state, CaseState::Running) {
            match event {
                CaseEvent::ResumeCase => return self.resume().await,
                CaseEvent::CancelCase => {}
                other => {
                    debug!(case = %self.case_id, "case suspended, queueing event");
                    self.queued.push_back(other);
                    return Ok(());
                }
            }
        }
        self.process_unit(event).await
    }

    async fn resume(&mut self) -> Result<(), EngineError> {
        self.state = CaseState::Running;
        if let Err(err) = self.store.save_snapshot(&self.view()).await {
            warn!(case = %self.case_id, error = %err, "snapshot write failed on resume");
        }
        self.flush(vec![Announcement::CaseResumed {
            case_id: self.case_id,
        }])
        .await;

        while matches!(self.state, CaseState::Running) {
            let Some(event) = self.queued.pop_front() else {
                break;
            };
            if let Err(err) = self.process_unit(event).await {
                warn!(case = %self.case_id, error = %err, "queued event rejected on resume");
            }
        }
        Ok(())
    }

    /// One atomic transition unit, with rollback and a single retry on
    /// persistence failure.
    async fn process_unit(&mut self, event: CaseEvent) -> Result<(), EngineError> {
        let checkpoint = self.checkpoint();
        let mut pending = Vec::new();

        match self.apply_unit(&event, &mut pending) {
            Ok(()) => {}
            Err(err) if err.is_fatal_to_case() => {
                self.restore(checkpoint);
                self.fault(err.to_string()).await;
                return Err(err);
            }
            Err(err) => {
                // Addressing error (unknown item etc): reject the event,
                // leave the case untouched.
                self.restore(checkpoint);
                return Err(err);
            }
        }

        match self.store.save_snapshot(&self.view()).await {
            Ok(()) => {
                self.flush(pending).await;
                Ok(())
            }
            Err(first) => {
                warn!(case = %self.case_id, error = %first, "snapshot write failed, retrying unit once");
                self.restore(checkpoint);
                let checkpoint = self.checkpoint();
                let mut pending = Vec::new();
                if let Err(err) = self.apply_unit(&event, &mut pending) {
                    self.restore(checkpoint);
                    return Err(err);
                }
                match self.store.save_snapshot(&self.view()).await {
                    Ok(()) => {
                        self.flush(pending).await;
                        Ok(())
                    }
                    Err(second) => {
                        self.restore(checkpoint);
                        self.fault(format!("persistence failure: {second}")).await;
                        Err(EngineError::Persistence(second.to_string()))
                    }
                }
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.state.clone(),
            marking: self.marking.clone(),
            items: self.items.clone(),
            flags: self.flags.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.state = checkpoint.state;
        self.marking = checkpoint.marking;
        self.items = checkpoint.items;
        self.flags = checkpoint.flags;
    }

    /// Park the case on a fatal fault and surface it outward.
    async fn fault(&mut self, fault: String) {
        warn!(case = %self.case_id, fault = %fault, "case faulted");
        self.state = CaseState::SuspendedFault {
            fault: fault.clone(),
        };
        if let Err(err) = self.store.save_snapshot(&self.view()).await {
            warn!(case = %self.case_id, error = %err, "snapshot write failed while faulting");
        }
        self.flush(vec![Announcement::CaseFaulted {
            case_id: self.case_id,
            fault,
        }])
        .await;
    }

    async fn persist_with_retry(&self) -> Result<(), EngineError> {
        if let Err(first) = self.store.save_snapshot(&self.view()).await {
            warn!(case = %self.case_id, error = %first, "snapshot write failed, retrying");
            self.store
                .save_snapshot(&self.view())
                .await
                .map_err(|err| EngineError::Persistence(err.to_string()))?;
        }
        Ok(())
    }

    /// Deliver announcements: append to the audit log and hand them to the
    /// outbound channel. Neither may stall the transition loop.
    async fn flush(&self, pending: Vec<Announcement>) {
        for announcement in pending {
            if let Err(err) = self.store.append_event(self.case_id, &announcement).await {
                warn!(case = %self.case_id, error = %err, "audit append failed");
            }
            let _ = self.announcer.send(announcement);
        }
    }

    // ── In-memory unit application ──

    fn apply_unit(
        &mut self,
        event: &CaseEvent,
        pending: &mut Vec<Announcement>,
    ) -> Result<(), EngineError> {
        match event {
            CaseEvent::StartWorkItem { item } => self.start_item(*item, pending),
            CaseEvent::CompleteWorkItem { item, flags } => {
                self.complete_item(*item, flags, pending)
            }
            CaseEvent::CancelWorkItem { item } => self.cancel_item(*item, pending),
            CaseEvent::FailWorkItem { item, reason } => self.fail_item(*item, reason, pending),
            CaseEvent::TimerFired { item } => self.timer_fired(*item, pending),
            CaseEvent::SuspendCase => {
                self.state = CaseState::Suspended;
                pending.push(Announcement::CaseSuspended {
                    case_id: self.case_id,
                });
                Ok(())
            }
            // Resume while running: nothing to do.
            CaseEvent::ResumeCase => Ok(()),
            CaseEvent::CancelCase => self.cancel_case(pending),
        }
    }

    fn start_item(&mut self, id: Uuid, pending: &mut Vec<Announcement>) -> Result<(), EngineError> {
        let (task_id, parent) = {
            let item = self.items.get(id)?;
            if item.state != WorkItemState::Enabled {
                return Err(EngineError::invariant(format!(
                    "start of work item {id} in state {:?}",
                    item.state
                )));
            }
            (item.task, item.parent)
        };

        // Children of a multiple-instance firing do not touch the marking:
        // the parent consumed the join tokens when it started.
        if parent.is_none() {
            self.consume_join(task_id)?;
        }

        let mi = self.net.task(task_id).multi_instance.clone();
        match (parent, mi) {
            (None, Some(mi)) => {
                self.items.get_mut(id)?.transition(WorkItemState::Fired)?;
                pending.push(Announcement::ItemStarted {
                    case_id: self.case_id,
                    item: id,
                    task: task_id,
                });
                let count = mi.instance_count(&self.flags);
                debug!(case = %self.case_id, task = task_id.0, count, "expanding multiple-instance task");
                for _ in 0..count {
                    let child =
                        self.items
                            .spawn(self.case_id, task_id, Some(id), &self.flags, now_ms());
                    pending.push(Announcement::ItemEnabled {
                        item: self.items.get(child)?.clone(),
                    });
                }
            }
            _ => {
                let item = self.items.get_mut(id)?;
                item.transition(WorkItemState::Fired)?;
                item.transition(WorkItemState::Executing)?;
                pending.push(Announcement::ItemStarted {
                    case_id: self.case_id,
                    item: id,
                    task: task_id,
                });
            }
        }
        self.reconcile(pending)
    }

    fn complete_item(
        &mut self,
        id: Uuid,
        flags_in: &BTreeMap<String, Value>,
        pending: &mut Vec<Announcement>,
    ) -> Result<(), EngineError> {
        let (task_id, parent) = {
            let item = self.items.get_mut(id)?;
            if item.state != WorkItemState::Executing {
                return Err(EngineError::invariant(format!(
                    "completion of work item {id} in state {:?}",
                    item.state
                )));
            }
            item.transition(WorkItemState::Complete)?;
            (item.task, item.parent)
        };
        for (key, value) in flags_in {
            self.flags.insert(key.clone(), value.clone());
        }
        pending.push(Announcement::ItemCompleted {
            case_id: self.case_id,
            item: id,
            task: task_id,
        });

        match parent {
            Some(parent_id) => self.on_child_completed(task_id, parent_id, pending)?,
            None => self.fire_outputs(task_id, pending)?,
        }
        self.reconcile(pending)
    }

    /// Multiple-instance fan-in: once `threshold` children completed,
    /// cancel the stragglers, complete the parent and deposit a single
    /// downstream token set.
    fn on_child_completed(
        &mut self,
        task_id: TaskId,
        parent_id: Uuid,
        pending: &mut Vec<Announcement>,
    ) -> Result<(), EngineError> {
        let mi = self
            .net
            .task(task_id)
            .multi_instance
            .clone()
            .ok_or_else(|| {
                EngineError::invariant(format!("work item with parent on non-MI task {task_id:?}"))
            })?;

        let completed = self.items.completed_children(parent_id) as u32;
        if completed >= mi.threshold {
            for child in self.items.live_children(parent_id) {
                self.cancel_single(child, pending)?;
            }
            let parent = self.items.get_mut(parent_id)?;
            parent.transition(WorkItemState::Executing)?;
            parent.transition(WorkItemState::Complete)?;
            pending.push(Announcement::ItemCompleted {
                case_id: self.case_id,
                item: parent_id,
                task: task_id,
            });
            self.fire_outputs(task_id, pending)?;
        } else if self.items.live_children(parent_id).is_empty() {
            return Err(EngineError::structural(
                "mi_threshold_unreachable",
                format!(
                    "multiple-instance task {:?}: {completed} of {} required completions, no live instances left",
                    task_id, mi.threshold
                ),
            ));
        }
        Ok(())
    }

    fn cancel_item(&mut self, id: Uuid, pending: &mut Vec<Announcement>) -> Result<(), EngineError> {
        let item = self.items.get(id)?;
        if item.state.is_terminal() {
            return Ok(());
        }
        let (task_id, parent) = (item.task, item.parent);
        // Cancelling a multiple-instance parent takes its children with it.
        for child in self.items.live_children(id) {
            self.cancel_single(child, pending)?;
        }
        self.cancel_single(id, pending)?;

        if let Some(parent_id) = parent {
            let mi = self.net.task(task_id).multi_instance.clone();
            if let Some(mi) = mi {
                let completed = self.items.completed_children(parent_id) as u32;
                if completed < mi.threshold && self.items.live_children(parent_id).is_empty() {
                    return Err(EngineError::structural(
                        "mi_threshold_unreachable",
                        format!(
                            "multiple-instance task {:?}: {completed} of {} required completions, no live instances left",
                            task_id, mi.threshold
                        ),
                    ));
                }
            }
        }
        self.reconcile(pending)
    }

    fn fail_item(
        &mut self,
        id: Uuid,
        reason: &str,
        pending: &mut Vec<Announcement>,
    ) -> Result<(), EngineError> {
        let item = self.items.get_mut(id)?;
        item.transition(WorkItemState::Failed)?;
        let task_id = item.task;
        pending.push(Announcement::ItemFailed {
            case_id: self.case_id,
            item: id,
            task: task_id,
            reason: reason.to_string(),
        });
        // The case stays running; an external collaborator decides whether
        // to retry, compensate or force-cancel.
        self.reconcile(pending)
    }

    /// A time trigger firing on an enabled item completes the task
    /// automatically, with no executor involved. Late or duplicate timer
    /// signals are ignored.
    fn timer_fired(&mut self, id: Uuid, pending: &mut Vec<Announcement>) -> Result<(), EngineError> {
        let task_id = match self.items.get(id) {
            Ok(item) if item.state == WorkItemState::Enabled => item.task,
            Ok(_) | Err(_) => {
                debug!(case = %self.case_id, item = %id, "ignoring late timer signal");
                return Ok(());
            }
        };
        if self.net.task(task_id).timer.is_none() {
            return Err(EngineError::invariant(format!(
                "timer signal for task {task_id:?} without a time trigger"
            )));
        }
        self.consume_join(task_id)?;
        let item = self.items.get_mut(id)?;
        item.transition(WorkItemState::Fired)?;
        item.transition(WorkItemState::Executing)?;
        item.transition(WorkItemState::Complete)?;
        pending.push(Announcement::ItemCompleted {
            case_id: self.case_id,
            item: id,
            task: task_id,
        });
        self.fire_outputs(task_id, pending)?;
        self.reconcile(pending)
    }

    fn cancel_case(&mut self, pending: &mut Vec<Announcement>) -> Result<(), EngineError> {
        let live: Vec<Uuid> = self.items.live().map(|i| i.id).collect();
        for id in live {
            self.cancel_single(id, pending)?;
        }
        let at = now_ms();
        self.state = CaseState::Cancelled { at };
        self.queued.clear();
        pending.push(Announcement::CaseCancelled {
            case_id: self.case_id,
            at,
        });
        info!(case = %self.case_id, "case cancelled");
        Ok(())
    }

    fn cancel_single(&mut self, id: Uuid, pending: &mut Vec<Announcement>) -> Result<(), EngineError> {
        let item = self.items.get_mut(id)?;
        let task_id = item.task;
        item.transition(WorkItemState::Cancelled)?;
        pending.push(Announcement::ItemCancelled {
            case_id: self.case_id,
            item: id,
            task: task_id,
        });
        Ok(())
    }

    // ── Firing rules ──

    fn consume_join(&mut self, task_id: TaskId) -> Result<(), EngineError> {
        let preset: Vec<_> = self.net.preset(task_id).to_vec();
        match self.net.task(task_id).join {
            JoinKind::And => {
                for c in preset {
                    self.marking.consume(c)?;
                }
            }
            JoinKind::Xor => {
                let c = preset
                    .into_iter()
                    .find(|&c| self.marking.marked(c))
                    .ok_or_else(|| {
                        EngineError::invariant(format!("firing {task_id:?} with no marked input"))
                    })?;
                self.marking.consume(c)?;
            }
            JoinKind::Or => {
                let marked: Vec<_> = preset
                    .into_iter()
                    .filter(|&c| self.marking.marked(c))
                    .collect();
                if marked.is_empty() {
                    return Err(EngineError::invariant(format!(
                        "firing {task_id:?} with no marked input"
                    )));
                }
                for c in marked {
                    self.marking.consume(c)?;
                }
            }
        }
        Ok(())
    }

    /// The completion half of a firing: cancellation region first (resets
    /// apply to the pre-firing state), then split token production.
    fn fire_outputs(
        &mut self,
        task_id: TaskId,
        pending: &mut Vec<Announcement>,
    ) -> Result<(), EngineError> {
        self.apply_cancellation(task_id, pending)?;
        self.produce_split(task_id)
    }

    fn apply_cancellation(
        &mut self,
        task_id: TaskId,
        pending: &mut Vec<Announcement>,
    ) -> Result<(), EngineError> {
        let targets = self.net.task(task_id).cancellation_set.clone();
        if targets.is_empty() {
            return Ok(());
        }
        debug!(case = %self.case_id, task = task_id.0, "applying cancellation region");
        for target in targets {
            match target {
                NodeRef::Cond(c) => {
                    let drained = self.marking.drain(c);
                    if drained > 0 {
                        debug!(case = %self.case_id, cond = c.0, drained, "drained condition");
                    }
                }
                NodeRef::Task(t) => {
                    for id in self.items.live_of_task(t) {
                        self.cancel_single(id, pending)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn produce_split(&mut self, task_id: TaskId) -> Result<(), EngineError> {
        let task = self.net.task(task_id);
        let flows: Vec<_> = self
            .net
            .out_flows(task_id)
            .iter()
            .map(|&f| self.net.flow(f).clone())
            .collect();
        let target_of = |flow: &crate::spec::Flow| match flow.target {
            NodeRef::Cond(c) => c,
            // The builder guarantees bipartite flows.
            NodeRef::Task(_) => unreachable!("task-to-task flow in built net"),
        };

        match task.split {
            SplitKind::And => {
                for flow in &flows {
                    self.marking.produce(target_of(flow));
                }
            }
            SplitKind::Xor => {
                let chosen = flows
                    .iter()
                    .filter(|f| !f.is_default)
                    .find(|f| f.predicate.as_ref().map_or(true, |p| p.eval(&self.flags)))
                    .or_else(|| flows.iter().find(|f| f.is_default));
                match chosen {
                    Some(flow) => self.marking.produce(target_of(flow)),
                    None => {
                        return Err(EngineError::structural(
                            "xor_split_unmatched",
                            format!(
                                "task '{}': no outgoing predicate matched and no default flow",
                                task.name
                            ),
                        ))
                    }
                }
            }
            SplitKind::Or => {
                let matched: Vec<_> = flows
                    .iter()
                    .filter(|f| {
                        !f.is_default && f.predicate.as_ref().map_or(true, |p| p.eval(&self.flags))
                    })
                    .collect();
                if matched.is_empty() {
                    match flows.iter().find(|f| f.is_default) {
                        Some(flow) => self.marking.produce(target_of(flow)),
                        None => {
                            return Err(EngineError::structural(
                                "or_split_unmatched",
                                format!(
                                    "task '{}': no outgoing predicate matched and no default flow",
                                    task.name
                                ),
                            ))
                        }
                    }
                } else {
                    for flow in matched {
                        self.marking.produce(target_of(flow));
                    }
                }
            }
        }
        Ok(())
    }

    // ── Post-event reconciliation ──

    /// Bring the work item set back in line with the marking: withdraw
    /// offers whose tokens were taken by a competing task, spawn items for
    /// newly enabled tasks, detect completion and deadlock.
    fn reconcile(&mut self, pending: &mut Vec<Announcement>) -> Result<(), EngineError> {
        // Withdraw stale offers (deferred choice: a competitor consumed the
        // shared token). An item's own liveness must not mask its task.
        let live = self.items.live_tasks();
        let stale: Vec<Uuid> = self
            .items
            .live()
            .filter(|i| i.state == WorkItemState::Enabled && i.parent.is_none())
            .filter(|i| {
                let mut others = live.clone();
                others.remove(&i.task);
                !join_satisfied(&self.net, &self.marking, &others, i.task)
            })
            .map(|i| i.id)
            .collect();
        for id in stale {
            debug!(case = %self.case_id, item = %id, "withdrawing stale offer");
            self.cancel_single(id, pending)?;
        }

        // Spawn items for newly enabled tasks.
        let live = self.items.live_tasks();
        for task_id in enabled_tasks(&self.net, &self.marking, &live) {
            let now = now_ms();
            let id = self
                .items
                .spawn(self.case_id, task_id, None, &self.flags, now);
            pending.push(Announcement::ItemEnabled {
                item: self.items.get(id)?.clone(),
            });
            if let Some(timer) = &self.net.task(task_id).timer {
                pending.push(Announcement::ScheduleTimer {
                    case_id: self.case_id,
                    item: id,
                    fire_at: now + timer.delay_ms as i64,
                });
            }
        }

        // Completion: the end condition received a token.
        if self.marking.marked(self.net.end()) {
            let leftovers: Vec<Uuid> = self.items.live().map(|i| i.id).collect();
            for id in leftovers {
                self.cancel_single(id, pending)?;
            }
            let at = now_ms();
            self.state = CaseState::Completed { at };
            pending.push(Announcement::CaseCompleted {
                case_id: self.case_id,
                at,
            });
            info!(case = %self.case_id, "case completed");
            return Ok(());
        }

        // No live items, nothing failed awaiting resolution, end unmarked:
        // the case can never progress again.
        let has_failed = self
            .items
            .iter()
            .any(|i| i.state == WorkItemState::Failed);
        if self.items.live().next().is_none() && !has_failed {
            return Err(EngineError::structural(
                "deadlock",
                "no live work items and the end condition is unmarked",
            ));
        }
        Ok(())
    }
}
