//! Enablement evaluation: which tasks may fire under a given marking.
//!
//! Everything here is pure — no side effects, callable repeatedly as the
//! marking evolves. AND- and XOR-joins are local decisions; the OR-join is
//! not: it must only fire once no unmarked input branch can still receive
//! a token, which requires a backward reachability fixpoint over the net
//! with the join itself removed.

use crate::marking::Marking;
use crate::spec::{CondId, JoinKind, Net, NodeRef, TaskId};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::BTreeSet;

/// Compute every task fireable under `marking`.
///
/// `live` is the set of tasks that currently have a live work item; such a
/// task is never re-enabled while its item is outstanding, and it counts
/// as a pending token source for OR-join analysis.
pub fn enabled_tasks(net: &Net, marking: &Marking, live: &BTreeSet<TaskId>) -> BTreeSet<TaskId> {
    net.task_ids()
        .filter(|t| !live.contains(t) && join_satisfied(net, marking, live, *t))
        .collect()
}

/// Whether the task's join requirement holds, ignoring whether it already
/// has a live work item.
pub fn join_satisfied(net: &Net, marking: &Marking, live: &BTreeSet<TaskId>, task: TaskId) -> bool {
    let preset = net.preset(task);
    if preset.is_empty() {
        return false;
    }
    match net.task(task).join {
        JoinKind::And => preset.iter().all(|&c| marking.marked(c)),
        JoinKind::Xor => preset.iter().any(|&c| marking.marked(c)),
        JoinKind::Or => or_join_enabled(net, marking, live, task),
    }
}

/// OR-join rule: at least one input condition is marked, and every
/// unmarked input condition is dead — no token can still reach it without
/// passing through the join itself.
fn or_join_enabled(net: &Net, marking: &Marking, live: &BTreeSet<TaskId>, join: TaskId) -> bool {
    let preset = net.preset(join);
    if !preset.iter().any(|&c| marking.marked(c)) {
        return false;
    }
    let unmarked: Vec<CondId> = preset
        .iter()
        .copied()
        .filter(|&c| !marking.marked(c))
        .collect();
    if unmarked.is_empty() {
        return true;
    }

    // Paths "through" the join are excluded from the analysis, so each
    // OR-join gets its own restricted graph.
    let graph = restricted_graph(net, join);
    let active = potentially_active(net, &graph, marking, live, join);

    unmarked.iter().all(|&c| {
        !graph
            .neighbors_directed(NodeRef::Cond(c), Direction::Incoming)
            .any(|n| matches!(n, NodeRef::Task(v) if active.contains(&v)))
    })
}

/// The net's flow graph with `excluded` (and its arcs) removed.
fn restricted_graph(net: &Net, excluded: TaskId) -> DiGraphMap<NodeRef, ()> {
    let mut graph = DiGraphMap::new();
    for c in net.condition_ids() {
        graph.add_node(NodeRef::Cond(c));
    }
    for t in net.task_ids() {
        if t == excluded {
            continue;
        }
        graph.add_node(NodeRef::Task(t));
        for &c in net.preset(t) {
            graph.add_edge(NodeRef::Cond(c), NodeRef::Task(t), ());
        }
        for &f in net.out_flows(t) {
            if let NodeRef::Cond(c) = net.flow(f).target {
                graph.add_edge(NodeRef::Task(t), NodeRef::Cond(c), ());
            }
        }
    }
    graph
}

/// Monotone fixpoint of "potentially active" tasks in the restricted graph.
///
/// An input condition is *fed* when it is marked or has a potentially
/// active producer. An AND-join task needs every input fed before it
/// counts as active: one permanently starved input blocks it forever, and
/// treating it as active would keep downstream branches alive that can
/// never receive a token. XOR- and OR-join tasks count as active with any
/// fed input (other OR-joins upstream are relaxed to "some branch" here).
fn potentially_active(
    net: &Net,
    graph: &DiGraphMap<NodeRef, ()>,
    marking: &Marking,
    live: &BTreeSet<TaskId>,
    excluded: TaskId,
) -> BTreeSet<TaskId> {
    let mut active: BTreeSet<TaskId> = live.iter().copied().filter(|&t| t != excluded).collect();
    loop {
        let mut changed = false;
        for t in net.task_ids() {
            if t == excluded || active.contains(&t) {
                continue;
            }
            let fed = {
                let cond_fed = |c: CondId| {
                    marking.marked(c)
                        || graph
                            .neighbors_directed(NodeRef::Cond(c), Direction::Incoming)
                            .any(|p| matches!(p, NodeRef::Task(v) if active.contains(&v)))
                };
                let mut inputs = graph
                    .neighbors_directed(NodeRef::Task(t), Direction::Incoming)
                    .filter_map(|n| match n {
                        NodeRef::Cond(c) => Some(c),
                        NodeRef::Task(_) => None,
                    })
                    .peekable();
                match net.task(t).join {
                    JoinKind::And => inputs.peek().is_some() && inputs.all(cond_fed),
                    JoinKind::Xor | JoinKind::Or => inputs.any(cond_fed),
                }
            };
            if fed {
                active.insert(t);
                changed = true;
            }
        }
        if !changed {
            return active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{NetBuilder, SplitKind};

    fn cond(c: CondId) -> NodeRef {
        NodeRef::Cond(c)
    }

    fn task(t: TaskId) -> NodeRef {
        NodeRef::Task(t)
    }

    /// start -> split(AND) -> {c1, c2} -> join -> end, join kind variable.
    fn diamond(join_kind: JoinKind) -> Net {
        let mut b = NetBuilder::new("diamond");
        let start = b.condition("start");
        let c1 = b.condition("c1");
        let c2 = b.condition("c2");
        let end = b.condition("end");
        let split = b.task("split", JoinKind::Xor, SplitKind::And);
        let join = b.task("join", join_kind, SplitKind::And);
        b.connect(cond(start), task(split));
        b.connect(task(split), cond(c1));
        b.connect(task(split), cond(c2));
        b.connect(cond(c1), task(join));
        b.connect(cond(c2), task(join));
        b.connect(task(join), cond(end));
        b.start_condition(start);
        b.end_condition(end);
        b.build().unwrap()
    }

    #[test]
    fn and_join_needs_all_inputs() {
        let net = diamond(JoinKind::And);
        let join = net.task_by_name("join").unwrap();
        let c1 = net.condition_by_name("c1").unwrap();
        let c2 = net.condition_by_name("c2").unwrap();
        let live = BTreeSet::new();

        let mut m = Marking::new();
        m.produce(c1);
        assert!(!enabled_tasks(&net, &m, &live).contains(&join));
        m.produce(c2);
        assert!(enabled_tasks(&net, &m, &live).contains(&join));
    }

    #[test]
    fn xor_join_needs_any_input() {
        let net = diamond(JoinKind::Xor);
        let join = net.task_by_name("join").unwrap();
        let c2 = net.condition_by_name("c2").unwrap();
        let live = BTreeSet::new();

        let mut m = Marking::new();
        assert!(!enabled_tasks(&net, &m, &live).contains(&join));
        m.produce(c2);
        assert!(enabled_tasks(&net, &m, &live).contains(&join));
    }

    #[test]
    fn live_task_is_not_reenabled() {
        let net = diamond(JoinKind::Xor);
        let join = net.task_by_name("join").unwrap();
        let c1 = net.condition_by_name("c1").unwrap();
        let mut m = Marking::new();
        m.produce(c1);

        let live = BTreeSet::from([join]);
        assert!(!enabled_tasks(&net, &m, &live).contains(&join));
        // The join requirement itself still holds.
        assert!(join_satisfied(&net, &m, &live, join));
    }

    /// Three-branch OR-join:
    ///
    ///   start -> entry(OR-split) -> {c1, c2, c3}
    ///   c1 -> a -> m1; c2 -> b -> m2; c3 -> c -> m3
    ///   {m1, m2, m3} -> join(OR) -> end
    fn three_branch_or_join() -> Net {
        let mut b = NetBuilder::new("or3");
        let start = b.condition("start");
        let end = b.condition("end");
        let entry = b.task("entry", JoinKind::Xor, SplitKind::Or);
        let join = b.task("join", JoinKind::Or, SplitKind::And);
        b.connect(cond(start), task(entry));
        for branch in ["a", "b", "c"] {
            let c_in = b.condition(format!("c_{branch}"));
            let m_out = b.condition(format!("m_{branch}"));
            let t = b.task(branch, JoinKind::Xor, SplitKind::And);
            b.connect(task(entry), cond(c_in));
            b.connect(cond(c_in), task(t));
            b.connect(task(t), cond(m_out));
            b.connect(cond(m_out), task(join));
        }
        b.connect(task(join), cond(end));
        b.start_condition(start);
        b.end_condition(end);
        b.build().unwrap()
    }

    #[test]
    fn or_join_waits_while_branch_can_still_deliver() {
        let net = three_branch_or_join();
        let join = net.task_by_name("join").unwrap();
        let live = BTreeSet::new();

        // Branches a and b have delivered; branch c's input is still marked,
        // so task c can still fire and deposit on m_c.
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        m.produce(net.condition_by_name("m_b").unwrap());
        m.produce(net.condition_by_name("c_c").unwrap());
        assert!(!join_satisfied(&net, &m, &live, join));
    }

    #[test]
    fn or_join_waits_while_branch_task_is_live() {
        let net = three_branch_or_join();
        let join = net.task_by_name("join").unwrap();
        let c_task = net.task_by_name("c").unwrap();

        // Task c already consumed its input token but its work item has not
        // completed yet: m_c is still reachable.
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        m.produce(net.condition_by_name("m_b").unwrap());
        let live = BTreeSet::from([c_task]);
        assert!(!join_satisfied(&net, &m, &live, join));

        // Once the item is gone (cancelled or the branch was never taken),
        // the third input is dead and the join fires.
        let live = BTreeSet::new();
        assert!(join_satisfied(&net, &m, &live, join));
    }

    #[test]
    fn or_join_fires_with_all_inputs_marked() {
        let net = three_branch_or_join();
        let join = net.task_by_name("join").unwrap();
        let mut m = Marking::new();
        for c in ["m_a", "m_b", "m_c"] {
            m.produce(net.condition_by_name(c).unwrap());
        }
        assert!(join_satisfied(&net, &m, &BTreeSet::new(), join));
    }

    #[test]
    fn or_join_sees_transitive_upstream_activity() {
        // start -> p -> mid -> q -> m_b, with m_a marked directly:
        // the join must wait while tokens two tasks upstream can still
        // propagate down to its second input.
        let mut b = NetBuilder::new("chain");
        let start = b.condition("start");
        let m_a = b.condition("m_a");
        let mid = b.condition("mid");
        let m_b = b.condition("m_b");
        let end = b.condition("end");
        let entry = b.task("entry", JoinKind::Xor, SplitKind::And);
        let p = b.task("p", JoinKind::Xor, SplitKind::And);
        let q = b.task("q", JoinKind::Xor, SplitKind::And);
        let join = b.task("join", JoinKind::Or, SplitKind::And);
        b.connect(cond(start), task(entry));
        b.connect(task(entry), cond(m_a));
        let c_p = b.condition("c_p");
        b.connect(task(entry), cond(c_p));
        b.connect(cond(c_p), task(p));
        b.connect(task(p), cond(mid));
        b.connect(cond(mid), task(q));
        b.connect(task(q), cond(m_b));
        b.connect(cond(m_a), task(join));
        b.connect(cond(m_b), task(join));
        b.connect(task(join), cond(end));
        b.start_condition(start);
        b.end_condition(end);
        let net = b.build().unwrap();

        let join = net.task_by_name("join").unwrap();
        let live = BTreeSet::new();

        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        m.produce(net.condition_by_name("c_p").unwrap());
        assert!(!join_satisfied(&net, &m, &live, join));

        // Token progressed to mid: still reachable through q.
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        m.produce(net.condition_by_name("mid").unwrap());
        assert!(!join_satisfied(&net, &m, &live, join));

        // Upstream thread is gone entirely: second input is dead.
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        assert!(join_satisfied(&net, &m, &live, join));
    }

    #[test]
    fn or_join_ignores_paths_through_itself() {
        // A loop back through the join must not count as a way to feed the
        // unmarked input: start-side token on m_a, loop condition fed only
        // by the join's own output.
        let mut b = NetBuilder::new("selfloop");
        let start = b.condition("start");
        let m_a = b.condition("m_a");
        let m_b = b.condition("m_b");
        let end = b.condition("end");
        let entry = b.task("entry", JoinKind::Xor, SplitKind::And);
        let join = b.task("join", JoinKind::Or, SplitKind::Xor);
        let back = b.task("back", JoinKind::Xor, SplitKind::And);
        b.connect(cond(start), task(entry));
        b.connect(task(entry), cond(m_a));
        b.connect(cond(m_a), task(join));
        b.connect(cond(m_b), task(join));
        let c_loop = b.condition("c_loop");
        b.connect_pred(
            task(join),
            cond(c_loop),
            crate::spec::Predicate::FlagTruthy("again".into()),
        );
        b.connect_default(task(join), cond(end));
        b.connect(cond(c_loop), task(back));
        b.connect(task(back), cond(m_b));
        b.start_condition(start);
        b.end_condition(end);
        let net = b.build().unwrap();

        let join = net.task_by_name("join").unwrap();
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        // m_b is only reachable via join -> c_loop -> back, i.e. through the
        // join itself. It must be classified dead.
        assert!(join_satisfied(&net, &m, &BTreeSet::new(), join));

        // But with a token already parked on the loop branch, `back` can
        // still deliver to m_b without the join firing first.
        m.produce(net.condition_by_name("c_loop").unwrap());
        assert!(!join_satisfied(&net, &m, &BTreeSet::new(), join));
    }

    /// Upstream AND-join:
    ///
    ///   start -> entry(AND-split) -> {m_a, ia, ib}
    ///   {ia, ib} -> u(AND-join) -> c
    ///   {m_a, c} -> join(OR) -> end
    fn upstream_and_join() -> Net {
        let mut b = NetBuilder::new("sync_branch");
        let start = b.condition("start");
        let m_a = b.condition("m_a");
        let ia = b.condition("ia");
        let ib = b.condition("ib");
        let c = b.condition("c");
        let end = b.condition("end");
        let entry = b.task("entry", JoinKind::Xor, SplitKind::And);
        let u = b.task("u", JoinKind::And, SplitKind::And);
        let join = b.task("join", JoinKind::Or, SplitKind::And);
        b.connect(cond(start), task(entry));
        b.connect(task(entry), cond(m_a));
        b.connect(task(entry), cond(ia));
        b.connect(task(entry), cond(ib));
        b.connect(cond(ia), task(u));
        b.connect(cond(ib), task(u));
        b.connect(task(u), cond(c));
        b.connect(cond(m_a), task(join));
        b.connect(cond(c), task(join));
        b.connect(task(join), cond(end));
        b.start_condition(start);
        b.end_condition(end);
        b.build().unwrap()
    }

    #[test]
    fn or_join_fires_past_starved_upstream_and_join() {
        let net = upstream_and_join();
        let join = net.task_by_name("join").unwrap();
        let live = BTreeSet::new();

        // `u` holds one of its two inputs, but `ib` can never be fed again
        // (entry's token is gone): `u` is permanently blocked, so `c` is
        // dead and the join must fire on m_a alone.
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        m.produce(net.condition_by_name("ia").unwrap());
        assert!(join_satisfied(&net, &m, &live, join));

        // Both of u's inputs marked: u can still deliver to c.
        m.produce(net.condition_by_name("ib").unwrap());
        assert!(!join_satisfied(&net, &m, &live, join));

        // Entry not yet fired: it can still feed both of u's inputs.
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        m.produce(net.condition_by_name("start").unwrap());
        assert!(!join_satisfied(&net, &m, &live, join));

        // A live item on u delivers to c regardless of the marking.
        let mut m = Marking::new();
        m.produce(net.condition_by_name("m_a").unwrap());
        let live = BTreeSet::from([net.task_by_name("u").unwrap()]);
        assert!(!join_satisfied(&net, &m, &live, join));
    }

    // ── Exhaustive reference check ──

    /// Brute-force liveness: explore every interleaving of upstream task
    /// firings (each task consumes one marked input and emits every split
    /// resolution) and report whether `target` can ever become marked
    /// without firing `forbidden`.
    fn reachable_without(
        net: &Net,
        marking: &Marking,
        live: &BTreeSet<TaskId>,
        forbidden: TaskId,
        target: CondId,
    ) -> bool {
        use std::collections::VecDeque;

        type State = (Vec<(CondId, u32)>, Vec<TaskId>);
        let encode = |m: &Marking, l: &BTreeSet<TaskId>| -> State {
            (
                m.marked_conditions().map(|c| (c, m.count(c))).collect(),
                l.iter().copied().collect(),
            )
        };

        let split_resolutions = |t: TaskId| -> Vec<Vec<CondId>> {
            let targets: Vec<CondId> = net
                .out_flows(t)
                .iter()
                .filter_map(|&f| match net.flow(f).target {
                    NodeRef::Cond(c) => Some(c),
                    NodeRef::Task(_) => None,
                })
                .collect();
            match net.task(t).split {
                SplitKind::And => vec![targets],
                SplitKind::Xor => targets.iter().map(|&c| vec![c]).collect(),
                SplitKind::Or => {
                    // Every non-empty subset.
                    let mut subsets = Vec::new();
                    for mask in 1u32..(1 << targets.len()) {
                        subsets.push(
                            targets
                                .iter()
                                .enumerate()
                                .filter(|(i, _)| mask & (1 << i) != 0)
                                .map(|(_, &c)| c)
                                .collect(),
                        );
                    }
                    subsets
                }
            }
        };

        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((marking.clone(), live.clone()));

        while let Some((m, l)) = queue.pop_front() {
            if m.marked(target) {
                return true;
            }
            if !seen.insert(encode(&m, &l)) || seen.len() > 20_000 {
                continue;
            }

            // A live item completing emits its task's split tokens.
            for &v in &l {
                if v == forbidden {
                    continue;
                }
                for resolution in split_resolutions(v) {
                    let mut m2 = m.clone();
                    for c in resolution {
                        m2.produce(c);
                    }
                    let mut l2 = l.clone();
                    l2.remove(&v);
                    queue.push_back((m2, l2));
                }
            }

            // Fire every currently fireable task per its join kind, then
            // emit each split resolution. Upstream OR-joins use the relaxed
            // any-marked rule, consuming every marked input.
            for u in net.task_ids() {
                if u == forbidden || l.contains(&u) {
                    continue;
                }
                let preset = net.preset(u);
                if preset.is_empty() {
                    continue;
                }
                match net.task(u).join {
                    JoinKind::And => {
                        if preset.iter().all(|&c| m.marked(c)) {
                            let mut consumed = m.clone();
                            for &c_in in preset {
                                consumed.consume(c_in).unwrap();
                            }
                            for resolution in split_resolutions(u) {
                                let mut m2 = consumed.clone();
                                for c in resolution {
                                    m2.produce(c);
                                }
                                queue.push_back((m2, l.clone()));
                            }
                        }
                    }
                    JoinKind::Xor => {
                        for &c_in in preset {
                            if !m.marked(c_in) {
                                continue;
                            }
                            for resolution in split_resolutions(u) {
                                let mut m2 = m.clone();
                                m2.consume(c_in).unwrap();
                                for c in resolution {
                                    m2.produce(c);
                                }
                                queue.push_back((m2, l.clone()));
                            }
                        }
                    }
                    JoinKind::Or => {
                        if preset.iter().any(|&c| m.marked(c)) {
                            let mut consumed = m.clone();
                            for &c_in in preset {
                                if m.marked(c_in) {
                                    consumed.consume(c_in).unwrap();
                                }
                            }
                            for resolution in split_resolutions(u) {
                                let mut m2 = consumed.clone();
                                for c in resolution {
                                    m2.produce(c);
                                }
                                queue.push_back((m2, l.clone()));
                            }
                        }
                    }
                }
            }
        }
        false
    }

    fn reference_or_join_enabled(
        net: &Net,
        marking: &Marking,
        live: &BTreeSet<TaskId>,
        join: TaskId,
    ) -> bool {
        let preset = net.preset(join);
        preset.iter().any(|&c| marking.marked(c))
            && preset
                .iter()
                .filter(|&&c| !marking.marked(c))
                .all(|&c| !reachable_without(net, marking, live, join, c))
    }

    #[test]
    fn or_join_matches_exhaustive_search() {
        let net = three_branch_or_join();
        let join = net.task_by_name("join").unwrap();
        let interesting: Vec<CondId> = ["c_a", "c_b", "c_c", "m_a", "m_b", "m_c", "start"]
            .iter()
            .map(|n| net.condition_by_name(n).unwrap())
            .collect();
        let branch_tasks: Vec<TaskId> = ["a", "b", "c"]
            .iter()
            .map(|n| net.task_by_name(n).unwrap())
            .collect();

        // Sweep every subset of marked conditions crossed with every subset
        // of live branch tasks.
        for cond_mask in 0u32..(1 << interesting.len()) {
            let mut m = Marking::new();
            for (i, &c) in interesting.iter().enumerate() {
                if cond_mask & (1 << i) != 0 {
                    m.produce(c);
                }
            }
            for live_mask in 0u32..(1 << branch_tasks.len()) {
                let live: BTreeSet<TaskId> = branch_tasks
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| live_mask & (1 << i) != 0)
                    .map(|(_, &t)| t)
                    .collect();
                assert_eq!(
                    join_satisfied(&net, &m, &live, join),
                    reference_or_join_enabled(&net, &m, &live, join),
                    "divergence at marking {m:?}, live {live:?}"
                );
            }
        }
    }

    #[test]
    fn upstream_and_join_matches_exhaustive_search() {
        let net = upstream_and_join();
        let join = net.task_by_name("join").unwrap();
        let conds: Vec<CondId> = ["start", "m_a", "ia", "ib", "c"]
            .iter()
            .map(|n| net.condition_by_name(n).unwrap())
            .collect();
        let upstream: Vec<TaskId> = ["entry", "u"]
            .iter()
            .map(|n| net.task_by_name(n).unwrap())
            .collect();

        for cond_mask in 0u32..(1 << conds.len()) {
            let mut m = Marking::new();
            for (i, &c) in conds.iter().enumerate() {
                if cond_mask & (1 << i) != 0 {
                    m.produce(c);
                }
            }
            for live_mask in 0u32..(1 << upstream.len()) {
                let live: BTreeSet<TaskId> = upstream
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| live_mask & (1 << i) != 0)
                    .map(|(_, &t)| t)
                    .collect();
                assert_eq!(
                    join_satisfied(&net, &m, &live, join),
                    reference_or_join_enabled(&net, &m, &live, join),
                    "divergence at marking {m:?}, live {live:?}"
                );
            }
        }
    }

    #[test]
    fn chain_net_matches_exhaustive_search() {
        // Same sweep over the two-level upstream chain net.
        let mut b = NetBuilder::new("chain2");
        let start = b.condition("start");
        let m_a = b.condition("m_a");
        let mid = b.condition("mid");
        let m_b = b.condition("m_b");
        let c_p = b.condition("c_p");
        let end = b.condition("end");
        let entry = b.task("entry", JoinKind::Xor, SplitKind::And);
        let p = b.task("p", JoinKind::Xor, SplitKind::And);
        let q = b.task("q", JoinKind::Xor, SplitKind::And);
        let join = b.task("join", JoinKind::Or, SplitKind::And);
        b.connect(cond(start), task(entry));
        b.connect(task(entry), cond(m_a));
        b.connect(task(entry), cond(c_p));
        b.connect(cond(c_p), task(p));
        b.connect(task(p), cond(mid));
        b.connect(cond(mid), task(q));
        b.connect(task(q), cond(m_b));
        b.connect(cond(m_a), task(join));
        b.connect(cond(m_b), task(join));
        b.connect(task(join), cond(end));
        b.start_condition(start);
        b.end_condition(end);
        let net = b.build().unwrap();

        let join = net.task_by_name("join").unwrap();
        let conds = [start, m_a, mid, m_b, c_p];
        let upstream = [p, q];

        for cond_mask in 0u32..(1 << conds.len()) {
            let mut m = Marking::new();
            for (i, &c) in conds.iter().enumerate() {
                if cond_mask & (1 << i) != 0 {
                    m.produce(c);
                }
            }
            for live_mask in 0u32..(1 << upstream.len()) {
                let live: BTreeSet<TaskId> = upstream
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| live_mask & (1 << i) != 0)
                    .map(|(_, &t)| t)
                    .collect();
                assert_eq!(
                    join_satisfied(&net, &m, &live, join),
                    reference_or_join_enabled(&net, &m, &live, join),
                    "divergence at marking {m:?}, live {live:?}"
                );
            }
        }
    }
}
