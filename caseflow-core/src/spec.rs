use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

// ─── Element ids ──────────────────────────────────────────────

/// Arena index of a condition within its `Net`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CondId(pub u32);

/// Arena index of a task within its `Net`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u32);

/// Arena index of a flow within its `Net`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowId(pub u32);

/// Either end of a flow. Nets are bipartite: flows connect tasks to
/// conditions and conditions to tasks, never like to like.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeRef {
    Cond(CondId),
    Task(TaskId),
}

// ─── Value / predicates ───────────────────────────────────────

/// A compact flag value used for routing decisions. Never domain payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I64(i64),
    Str(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::I64(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

/// Flow predicate, evaluated against the case's flag map at firing time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Const(bool),
    /// True when the named flag exists and is truthy.
    FlagTruthy(String),
    FlagEquals(String, Value),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eval(&self, flags: &BTreeMap<String, Value>) -> bool {
        match self {
            Predicate::Const(b) => *b,
            Predicate::FlagTruthy(key) => flags.get(key).is_some_and(Value::is_truthy),
            Predicate::FlagEquals(key, want) => flags.get(key) == Some(want),
            Predicate::Not(inner) => !inner.eval(flags),
        }
    }
}

// ─── Split / join kinds ───────────────────────────────────────

/// Join behavior of a task. Fixed at specification time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    And,
    Xor,
    Or,
}

/// Split behavior of a task. Fixed at specification time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitKind {
    And,
    Xor,
    Or,
}

// ─── Multiple-instance / timer parameters ─────────────────────

/// Parameters for a multiple-instance task.
///
/// Firing spawns between `min` and `max` child instances; the requested
/// count is read from `count_flag` (when set) and clamped to `[min, max]`.
/// The task's fan-in collapses to a single downstream token once
/// `threshold` instances have completed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    pub min: u32,
    pub max: u32,
    pub threshold: u32,
    /// Case flag holding the dynamic creation count. `None` = always `min`.
    pub count_flag: Option<String>,
}

impl MultiInstanceSpec {
    /// Resolve the instance count against the case flags, clamped to [min, max].
    pub fn instance_count(&self, flags: &BTreeMap<String, Value>) -> u32 {
        let requested = match &self.count_flag {
            Some(key) => match flags.get(key) {
                Some(Value::I64(n)) if *n > 0 => *n as u32,
                _ => self.min,
            },
            None => self.min,
        };
        requested.clamp(self.min, self.max)
    }
}

/// A time trigger: the engine requests a timer on enablement and the
/// external timer service injects a `TimerFired` event at the deadline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerSpec {
    pub delay_ms: u64,
}

// ─── Net elements ─────────────────────────────────────────────

/// A place that holds control tokens between tasks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
}

/// A unit of work. Consumes tokens per its join kind and produces tokens
/// per its split kind when fired.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub join: JoinKind,
    pub split: SplitKind,
    /// Elements drained/cancelled atomically when this task fires.
    pub cancellation_set: Vec<NodeRef>,
    pub multi_instance: Option<MultiInstanceSpec>,
    pub timer: Option<TimerSpec>,
}

/// A directed arc. Predicates are only meaningful on task-sourced flows
/// (split routing); `ordering` drives XOR-split evaluation order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub source: NodeRef,
    pub target: NodeRef,
    pub predicate: Option<Predicate>,
    pub ordering: u32,
    pub is_default: bool,
}

// ─── Net ──────────────────────────────────────────────────────

/// An immutable workflow net. Built once through `NetBuilder`, shared by
/// reference across every case instantiated from it, never mutated after.
///
/// All elements live in flat arenas and reference each other by integer
/// id; adjacency is precomputed at build time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Net {
    pub name: String,
    pub version: u32,
    conditions: Vec<Condition>,
    tasks: Vec<Task>,
    flows: Vec<Flow>,
    start: CondId,
    end: CondId,

    // Derived adjacency (built by NetBuilder::build).
    task_preset: Vec<Vec<CondId>>,
    /// Outgoing flows per task, sorted by `ordering`.
    task_out_flows: Vec<Vec<FlowId>>,
    cond_producers: Vec<Vec<TaskId>>,
    cond_consumers: Vec<Vec<TaskId>>,
}

impl Net {
    pub fn start(&self) -> CondId {
        self.start
    }

    pub fn end(&self) -> CondId {
        self.end
    }

    pub fn condition(&self, id: CondId) -> &Condition {
        &self.conditions[id.0 as usize]
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0 as usize]
    }

    pub fn flow(&self, id: FlowId) -> &Flow {
        &self.flows[id.0 as usize]
    }

    pub fn condition_ids(&self) -> impl Iterator<Item = CondId> {
        (0..self.conditions.len() as u32).map(CondId)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> {
        (0..self.tasks.len() as u32).map(TaskId)
    }

    /// Conditions with a flow into the task.
    pub fn preset(&self, task: TaskId) -> &[CondId] {
        &self.task_preset[task.0 as usize]
    }

    /// Outgoing flows of the task, in `ordering` order.
    pub fn out_flows(&self, task: TaskId) -> &[FlowId] {
        &self.task_out_flows[task.0 as usize]
    }

    /// Tasks with a flow into the condition.
    pub fn producers(&self, cond: CondId) -> &[TaskId] {
        &self.cond_producers[cond.0 as usize]
    }

    /// Tasks with a flow out of the condition.
    pub fn consumers(&self, cond: CondId) -> &[TaskId] {
        &self.cond_consumers[cond.0 as usize]
    }

    pub fn task_by_name(&self, name: &str) -> Option<TaskId> {
        self.tasks
            .iter()
            .position(|t| t.name == name)
            .map(|i| TaskId(i as u32))
    }

    pub fn condition_by_name(&self, name: &str) -> Option<CondId> {
        self.conditions
            .iter()
            .position(|c| c.name == name)
            .map(|i| CondId(i as u32))
    }
}

// ─── Builder + structural validation ──────────────────────────

#[derive(Debug, Clone)]
pub struct SpecError {
    pub rule: &'static str,
    pub message: String,
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Builder for a `Net`. Collects elements, then checks the structural
/// invariants in `build()`; malformed input never reaches the engine.
pub struct NetBuilder {
    name: String,
    version: u32,
    conditions: Vec<Condition>,
    tasks: Vec<Task>,
    flows: Vec<Flow>,
    start: Option<CondId>,
    end: Option<CondId>,
    next_ordering: u32,
}

impl NetBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            conditions: Vec::new(),
            tasks: Vec::new(),
            flows: Vec::new(),
            start: None,
            end: None,
            next_ordering: 0,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn condition(&mut self, name: impl Into<String>) -> CondId {
        let id = CondId(self.conditions.len() as u32);
        self.conditions.push(Condition { name: name.into() });
        id
    }

    pub fn task(&mut self, name: impl Into<String>, join: JoinKind, split: SplitKind) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(Task {
            name: name.into(),
            join,
            split,
            cancellation_set: Vec::new(),
            multi_instance: None,
            timer: None,
        });
        id
    }

    pub fn set_cancellation_set(&mut self, task: TaskId, targets: Vec<NodeRef>) {
        self.tasks[task.0 as usize].cancellation_set = targets;
    }

    pub fn set_multi_instance(&mut self, task: TaskId, mi: MultiInstanceSpec) {
        self.tasks[task.0 as usize].multi_instance = Some(mi);
    }

    pub fn set_timer(&mut self, task: TaskId, timer: TimerSpec) {
        self.tasks[task.0 as usize].timer = Some(timer);
    }

    /// Connect two nodes with an unconditional flow. A task→task arc gets
    /// an implicit condition inserted between the two endpoints.
    pub fn connect(&mut self, source: NodeRef, target: NodeRef) -> FlowId {
        self.connect_with(source, target, None, false)
    }

    /// Connect with a routing predicate (task-sourced flows only).
    pub fn connect_pred(&mut self, source: NodeRef, target: NodeRef, pred: Predicate) -> FlowId {
        self.connect_with(source, target, Some(pred), false)
    }

    /// Connect the split's default flow, taken when no predicate matches.
    pub fn connect_default(&mut self, source: NodeRef, target: NodeRef) -> FlowId {
        self.connect_with(source, target, None, true)
    }

    fn connect_with(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        predicate: Option<Predicate>,
        is_default: bool,
    ) -> FlowId {
        if let (NodeRef::Task(src), NodeRef::Task(dst)) = (source, target) {
            // Implicit condition between two directly-connected tasks.
            let name = format!(
                "c_{}_{}",
                self.tasks[src.0 as usize].name, self.tasks[dst.0 as usize].name
            );
            let mid = self.condition(name);
            let first = self.push_flow(source, NodeRef::Cond(mid), predicate, is_default);
            self.push_flow(NodeRef::Cond(mid), target, None, false);
            return first;
        }
        self.push_flow(source, target, predicate, is_default)
    }

    fn push_flow(
        &mut self,
        source: NodeRef,
        target: NodeRef,
        predicate: Option<Predicate>,
        is_default: bool,
    ) -> FlowId {
        let id = FlowId(self.flows.len() as u32);
        let ordering = self.next_ordering;
        self.next_ordering += 1;
        self.flows.push(Flow {
            source,
            target,
            predicate,
            ordering,
            is_default,
        });
        id
    }

    pub fn start_condition(&mut self, cond: CondId) {
        self.start = Some(cond);
    }

    pub fn end_condition(&mut self, cond: CondId) {
        self.end = Some(cond);
    }

    pub fn build(self) -> Result<Net, Vec<SpecError>> {
        let mut errors = Vec::new();

        // S1: start and end designated and distinct
        let (start, end) = match (self.start, self.end) {
            (Some(s), Some(e)) if s != e => (s, e),
            (Some(s), Some(_)) => {
                errors.push(SpecError {
                    rule: "S1",
                    message: "start and end conditions must be distinct".into(),
                });
                (s, s)
            }
            _ => {
                errors.push(SpecError {
                    rule: "S1",
                    message: "start and end conditions must both be designated".into(),
                });
                return Err(errors);
            }
        };

        // S8: flows must alternate task/condition
        for flow in &self.flows {
            if matches!(
                (flow.source, flow.target),
                (NodeRef::Cond(_), NodeRef::Cond(_)) | (NodeRef::Task(_), NodeRef::Task(_))
            ) {
                errors.push(SpecError {
                    rule: "S8",
                    message: format!(
                        "flow {:?} -> {:?} must connect a task and a condition",
                        flow.source, flow.target
                    ),
                });
            }
        }

        // S5: predicates only on task-sourced flows
        for flow in &self.flows {
            if flow.predicate.is_some() && !matches!(flow.source, NodeRef::Task(_)) {
                errors.push(SpecError {
                    rule: "S5",
                    message: "predicates are only allowed on task-sourced flows".into(),
                });
            }
        }

        // Derived adjacency.
        let mut task_preset = vec![Vec::new(); self.tasks.len()];
        let mut task_out_flows: Vec<Vec<FlowId>> = vec![Vec::new(); self.tasks.len()];
        let mut cond_producers = vec![Vec::new(); self.conditions.len()];
        let mut cond_consumers = vec![Vec::new(); self.conditions.len()];
        let mut cond_in_flows = vec![0usize; self.conditions.len()];

        for (i, flow) in self.flows.iter().enumerate() {
            match (flow.source, flow.target) {
                (NodeRef::Cond(c), NodeRef::Task(t)) => {
                    task_preset[t.0 as usize].push(c);
                    cond_consumers[c.0 as usize].push(t);
                }
                (NodeRef::Task(t), NodeRef::Cond(c)) => {
                    task_out_flows[t.0 as usize].push(FlowId(i as u32));
                    cond_producers[c.0 as usize].push(t);
                    cond_in_flows[c.0 as usize] += 1;
                }
                _ => {} // reported under S8 above
            }
        }
        for flows in task_out_flows.iter_mut() {
            flows.sort_by_key(|f| self.flows[f.0 as usize].ordering);
        }

        // S2: every non-start condition has at least one incoming flow
        for (i, count) in cond_in_flows.iter().enumerate() {
            let id = CondId(i as u32);
            if id != start && *count == 0 {
                errors.push(SpecError {
                    rule: "S2",
                    message: format!(
                        "condition '{}' has no incoming flow",
                        self.conditions[i].name
                    ),
                });
            }
        }

        // S3: every element reachable from start
        {
            let mut seen_c = vec![false; self.conditions.len()];
            let mut seen_t = vec![false; self.tasks.len()];
            let mut queue = vec![NodeRef::Cond(start)];
            while let Some(node) = queue.pop() {
                match node {
                    NodeRef::Cond(c) => {
                        if std::mem::replace(&mut seen_c[c.0 as usize], true) {
                            continue;
                        }
                        for &t in &cond_consumers[c.0 as usize] {
                            queue.push(NodeRef::Task(t));
                        }
                    }
                    NodeRef::Task(t) => {
                        if std::mem::replace(&mut seen_t[t.0 as usize], true) {
                            continue;
                        }
                        for &f in &task_out_flows[t.0 as usize] {
                            queue.push(self.flows[f.0 as usize].target);
                        }
                    }
                }
            }
            for (i, seen) in seen_c.iter().enumerate() {
                if !*seen {
                    errors.push(SpecError {
                        rule: "S3",
                        message: format!(
                            "condition '{}' is unreachable from start",
                            self.conditions[i].name
                        ),
                    });
                }
            }
            for (i, seen) in seen_t.iter().enumerate() {
                if !*seen {
                    errors.push(SpecError {
                        rule: "S3",
                        message: format!("task '{}' is unreachable from start", self.tasks[i].name),
                    });
                }
            }
        }

        // S4: at most one default flow per split; defaults carry no predicate
        for (i, task) in self.tasks.iter().enumerate() {
            let defaults: Vec<&Flow> = task_out_flows[i]
                .iter()
                .map(|f| &self.flows[f.0 as usize])
                .filter(|f| f.is_default)
                .collect();
            if defaults.len() > 1 {
                errors.push(SpecError {
                    rule: "S4",
                    message: format!("task '{}' has more than one default flow", task.name),
                });
            }
            if defaults.iter().any(|f| f.predicate.is_some()) {
                errors.push(SpecError {
                    rule: "S4",
                    message: format!("task '{}' default flow must not carry a predicate", task.name),
                });
            }
        }

        // S6: multiple-instance bounds
        for task in &self.tasks {
            if let Some(mi) = &task.multi_instance {
                if mi.min < 1 || mi.min > mi.max || mi.threshold < 1 || mi.threshold > mi.max {
                    errors.push(SpecError {
                        rule: "S6",
                        message: format!(
                            "task '{}': require 1 <= min <= max and 1 <= threshold <= max",
                            task.name
                        ),
                    });
                }
            }
        }

        // S7: cancellation targets must exist
        for task in &self.tasks {
            for target in &task.cancellation_set {
                let ok = match target {
                    NodeRef::Cond(c) => (c.0 as usize) < self.conditions.len(),
                    NodeRef::Task(t) => (t.0 as usize) < self.tasks.len(),
                };
                if !ok {
                    errors.push(SpecError {
                        rule: "S7",
                        message: format!(
                            "task '{}': cancellation target {:?} does not exist",
                            task.name, target
                        ),
                    });
                }
            }
        }

        // S9: end condition is a sink
        if cond_consumers
            .get(end.0 as usize)
            .is_some_and(|c| !c.is_empty())
        {
            errors.push(SpecError {
                rule: "S9",
                message: "end condition must have no outgoing flows".into(),
            });
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Net {
            name: self.name,
            version: self.version,
            conditions: self.conditions,
            tasks: self.tasks,
            flows: self.flows,
            start,
            end,
            task_preset,
            task_out_flows,
            cond_producers,
            cond_consumers,
        })
    }
}
