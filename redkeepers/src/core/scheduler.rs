//! Deterministic selection of the next ready work item.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::policy::RoutingPolicy;
use crate::core::queue::Queue;
use crate::core::routing::routed_agent_id;
use crate::core::stats::AgentStats;
use crate::core::types::{ItemStatus, Priority, WorkItem};

/// How much completing a candidate would unblock downstream queued work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnlockMetrics {
    /// Dependants whose only unmet dependency is the candidate.
    pub immediate: u64,
    pub weighted_immediate: u64,
    /// All queued dependants.
    pub total: u64,
    pub weighted_total: u64,
    /// Dependants reached at depth two or more.
    pub transitive: u64,
    pub weighted_transitive: u64,
}

impl UnlockMetrics {
    pub fn unblock_value(&self) -> u64 {
        12 * self.weighted_immediate
            + 8 * self.immediate
            + 4 * self.weighted_total
            + 2 * self.total
            + 2 * self.weighted_transitive
            + self.transitive
    }
}

/// A ready item with every sort-key component computed.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub item: &'a WorkItem,
    pub base_rank: u32,
    pub effective_rank: u32,
    pub unlock: UnlockMetrics,
    pub unblock_value: u64,
    pub agent_load: (f64, u64),
}

/// Dependency index: dependency id to queued dependants. Built once per call.
struct DependantIndex<'a> {
    by_dependency: HashMap<&'a str, Vec<&'a WorkItem>>,
}

impl<'a> DependantIndex<'a> {
    fn build(queue: &'a Queue) -> Self {
        let mut by_dependency: HashMap<&str, Vec<&WorkItem>> = HashMap::new();
        for item in queue
            .active
            .iter()
            .filter(|item| item.status == ItemStatus::Queued)
        {
            for dep in &item.dependencies {
                by_dependency.entry(dep.as_str()).or_default().push(item);
            }
        }
        Self { by_dependency }
    }

    fn dependants(&self, id: &str) -> &[&'a WorkItem] {
        self.by_dependency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn unlock_metrics(
    candidate: &WorkItem,
    index: &DependantIndex<'_>,
    completed: &HashSet<&str>,
) -> UnlockMetrics {
    let mut metrics = UnlockMetrics::default();
    let mut visited: HashSet<&str> = HashSet::from([candidate.id.as_str()]);
    let mut frontier: VecDeque<&WorkItem> = VecDeque::new();

    for dependant in index.dependants(&candidate.id) {
        if !visited.insert(dependant.id.as_str()) {
            continue;
        }
        let weight = dependant.priority.unlock_weight();
        metrics.total += 1;
        metrics.weighted_total += weight;
        let others_done = dependant
            .dependencies
            .iter()
            .filter(|dep| dep.as_str() != candidate.id)
            .all(|dep| completed.contains(dep.as_str()));
        if others_done {
            metrics.immediate += 1;
            metrics.weighted_immediate += weight;
        }
        frontier.push_back(dependant);
    }

    // Cycles in the dependency data terminate on the visited set.
    while let Some(node) = frontier.pop_front() {
        for dependant in index.dependants(&node.id) {
            if !visited.insert(dependant.id.as_str()) {
                continue;
            }
            metrics.transitive += 1;
            metrics.weighted_transitive += dependant.priority.unlock_weight();
            frontier.push_back(dependant);
        }
    }
    metrics
}

fn effective_rank(item: &WorkItem, unlock: &UnlockMetrics, routing: &RoutingPolicy) -> u32 {
    let base = item.priority.rank();
    let mut rank = base;

    let boost = &routing.dependency_unlock_priority;
    if boost.enabled {
        let signal = if boost.prefer_immediate_unblocks {
            unlock.weighted_immediate
        } else {
            unlock.weighted_total
        };
        let protected_critical = boost.critical_priority_protected && base == 0;
        if signal > 0 && !protected_critical {
            rank = base.saturating_sub(boost.priority_boost_levels.min(3));
            if boost.critical_priority_protected {
                rank = rank.max(1);
            }
        }
    }

    let fast = &routing.fast_cycle_role_priority;
    if fast.enabled
        && fast.deprioritize_roles.iter().any(|role| role == &item.owner_role)
        && !(item.priority == Priority::Critical && fast.except_critical_priority)
    {
        rank += fast.deprioritize_levels;
    }
    rank
}

fn compare(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.effective_rank
        .cmp(&b.effective_rank)
        .then_with(|| b.unblock_value.cmp(&a.unblock_value))
        .then_with(|| b.unlock.weighted_immediate.cmp(&a.unlock.weighted_immediate))
        .then_with(|| b.unlock.weighted_total.cmp(&a.unlock.weighted_total))
        .then_with(|| b.unlock.immediate.cmp(&a.unlock.immediate))
        .then_with(|| b.unlock.total.cmp(&a.unlock.total))
        .then_with(|| a.base_rank.cmp(&b.base_rank))
        .then_with(|| a.item.created_at.cmp(&b.item.created_at))
        .then_with(|| a.agent_load.0.total_cmp(&b.agent_load.0))
        .then_with(|| a.agent_load.1.cmp(&b.agent_load.1))
        .then_with(|| a.item.id.cmp(&b.item.id))
}

/// Every ready item in selection order.
pub fn rank_candidates<'a>(
    queue: &'a Queue,
    routing: &RoutingPolicy,
    stats: &AgentStats,
) -> Vec<Candidate<'a>> {
    let ready = queue.ready_items();
    if ready.is_empty() {
        return Vec::new();
    }
    let index = DependantIndex::build(queue);
    let completed = queue.completed_ids();

    let mut candidates: Vec<Candidate<'a>> = ready
        .into_iter()
        .map(|item| {
            let unlock = unlock_metrics(item, &index, &completed);
            let agent = routed_agent_id(item, routing);
            Candidate {
                item,
                base_rank: item.priority.rank(),
                effective_rank: effective_rank(item, &unlock, routing),
                unblock_value: unlock.unblock_value(),
                unlock,
                agent_load: stats.load_of(agent.as_deref()),
            }
        })
        .collect();
    candidates.sort_by(compare);
    candidates
}

/// The next item to run, cloned out of the queue, or `None` when nothing is ready.
pub fn select_next(queue: &Queue, routing: &RoutingPolicy, stats: &AgentStats) -> Option<WorkItem> {
    rank_candidates(queue, routing, stats)
        .into_iter()
        .next()
        .map(|candidate| candidate.item.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stats::AgentCounters;
    use crate::test_support::{T0, T1, item, queued};

    fn boost_policy() -> RoutingPolicy {
        let mut routing = RoutingPolicy::default();
        routing.dependency_unlock_priority.enabled = true;
        routing.dependency_unlock_priority.priority_boost_levels = 1;
        routing
    }

    fn unlock_shape(first: WorkItem) -> Queue {
        let unlocker = item("NORMAL-UNLOCK", Priority::Normal, &[]);
        let down = item("DOWN-1", Priority::High, &["NORMAL-UNLOCK"]);
        Queue::new(vec![first, unlocker, down], Vec::new(), Vec::new())
    }

    #[test]
    fn unlocker_is_boosted_past_equal_rank() {
        let queue = unlock_shape(item("HIGH-1", Priority::High, &[]));
        let selected = select_next(&queue, &boost_policy(), &AgentStats::default()).expect("ready");
        assert_eq!(selected.id, "NORMAL-UNLOCK");
    }

    #[test]
    fn boost_applies_whatever_the_dependant_priority() {
        let queue = Queue::new(
            vec![
                item("HIGH-1", Priority::High, &[]),
                item("NORMAL-UNLOCK", Priority::Normal, &[]),
                item("LOW-DOWN", Priority::Low, &["NORMAL-UNLOCK"]),
            ],
            Vec::new(),
            Vec::new(),
        );
        let ranked = rank_candidates(&queue, &boost_policy(), &AgentStats::default());
        assert_eq!(ranked[0].item.id, "NORMAL-UNLOCK");
        assert_eq!(ranked[0].effective_rank, 1);
        assert_eq!(ranked[1].item.id, "HIGH-1");
    }

    #[test]
    fn critical_item_is_not_overridden_by_boost() {
        let queue = unlock_shape(item("CRIT-1", Priority::Critical, &[]));
        let selected = select_next(&queue, &boost_policy(), &AgentStats::default()).expect("ready");
        assert_eq!(selected.id, "CRIT-1");
    }

    #[test]
    fn boost_disabled_falls_back_to_priority() {
        let queue = unlock_shape(item("HIGH-1", Priority::High, &[]));
        let selected =
            select_next(&queue, &RoutingPolicy::default(), &AgentStats::default()).expect("ready");
        assert_eq!(selected.id, "HIGH-1");
    }

    #[test]
    fn protection_keeps_boosted_items_out_of_critical_rank() {
        let mut routing = boost_policy();
        routing.dependency_unlock_priority.priority_boost_levels = 3;
        let queue = Queue::new(
            vec![
                item("LOW-1", Priority::Low, &[]),
                item("DOWN", Priority::Critical, &["LOW-1"]),
            ],
            Vec::new(),
            Vec::new(),
        );
        let ranked = rank_candidates(&queue, &routing, &AgentStats::default());
        assert_eq!(ranked[0].effective_rank, 1);
    }

    #[test]
    fn only_ready_items_are_candidates() {
        let queue = Queue::new(
            vec![item("A", Priority::High, &["MISSING"]), item("B", Priority::Low, &[])],
            Vec::new(),
            Vec::new(),
        );
        let ranked = rank_candidates(&queue, &RoutingPolicy::default(), &AgentStats::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].item.id, "B");
    }

    #[test]
    fn empty_ready_set_selects_nothing() {
        let mut running = queued("A");
        running.status = ItemStatus::Running;
        let queue = Queue::new(vec![running], Vec::new(), Vec::new());
        assert!(select_next(&queue, &RoutingPolicy::default(), &AgentStats::default()).is_none());
    }

    #[test]
    fn unlock_metrics_count_immediate_total_and_transitive() {
        let mut completed = queued("DONE");
        completed.status = ItemStatus::Completed;
        let queue = Queue::new(
            vec![
                item("ROOT", Priority::Normal, &[]),
                item("IMMEDIATE", Priority::High, &["ROOT", "DONE"]),
                item("WAITING", Priority::Low, &["ROOT", "OTHER"]),
                item("DEEP", Priority::Critical, &["IMMEDIATE"]),
                item("OTHER", Priority::Normal, &[]),
            ],
            vec![completed],
            Vec::new(),
        );
        let ranked = rank_candidates(&queue, &RoutingPolicy::default(), &AgentStats::default());
        let root = ranked
            .iter()
            .find(|c| c.item.id == "ROOT")
            .expect("root ranked");
        assert_eq!(root.unlock.immediate, 1);
        assert_eq!(root.unlock.weighted_immediate, 4);
        assert_eq!(root.unlock.total, 2);
        assert_eq!(root.unlock.weighted_total, 5);
        assert_eq!(root.unlock.transitive, 1);
        assert_eq!(root.unlock.weighted_transitive, 8);
        assert_eq!(root.unblock_value, 12 * 4 + 8 + 4 * 5 + 2 * 2 + 2 * 8 + 1);
    }

    #[test]
    fn dependency_cycles_terminate() {
        let queue = Queue::new(
            vec![
                item("A", Priority::Normal, &[]),
                item("B", Priority::Normal, &["A", "C"]),
                item("C", Priority::Normal, &["B"]),
            ],
            Vec::new(),
            Vec::new(),
        );
        let ranked = rank_candidates(&queue, &RoutingPolicy::default(), &AgentStats::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].unlock.total, 1);
        assert_eq!(ranked[0].unlock.transitive, 1);
    }

    #[test]
    fn fast_cycle_bias_demotes_listed_roles() {
        let mut routing = RoutingPolicy::default();
        routing.fast_cycle_role_priority.enabled = true;
        routing.fast_cycle_role_priority.deprioritize_roles = vec!["qa".to_string()];
        let mut qa = item("QA-1", Priority::High, &[]);
        qa.owner_role = "qa".to_string();
        let queue = Queue::new(
            vec![qa, item("DEV-1", Priority::Normal, &[])],
            Vec::new(),
            Vec::new(),
        );
        // tie on rank 2; base rank decides
        let ranked = rank_candidates(&queue, &routing, &AgentStats::default());
        assert_eq!(ranked[0].item.id, "QA-1");
        assert_eq!(ranked[0].effective_rank, 2);

        routing.fast_cycle_role_priority.deprioritize_levels = 2;
        assert_eq!(select_next(&queue, &routing, &AgentStats::default()).expect("ready").id, "DEV-1");
    }

    #[test]
    fn agent_load_and_id_break_ties() {
        let mut routing = RoutingPolicy::default();
        routing.owner_role_map.insert("backend".to_string(), "busy".to_string());
        routing.owner_role_map.insert("frontend".to_string(), "idle".to_string());
        let mut busy = item("A", Priority::Normal, &[]);
        busy.owner_role = "backend".to_string();
        let mut idle = item("B", Priority::Normal, &[]);
        idle.owner_role = "frontend".to_string();
        let mut stats = AgentStats::default();
        stats.agents.insert(
            "busy".to_string(),
            AgentCounters {
                total_runs: 4,
                current_load_score: 3.0,
                ..AgentCounters::default()
            },
        );
        let queue = Queue::new(vec![busy, idle], Vec::new(), Vec::new());
        assert_eq!(select_next(&queue, &routing, &stats).expect("ready").id, "B");

        let queue = Queue::new(
            vec![item("Z", Priority::Normal, &[]), item("Y", Priority::Normal, &[])],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(select_next(&queue, &routing, &stats).expect("ready").id, "Y");
    }

    #[test]
    fn older_items_win_at_equal_rank() {
        let mut newer = item("A", Priority::Normal, &[]);
        newer.created_at = T1.to_string();
        let mut older = item("B", Priority::Normal, &[]);
        older.created_at = T0.to_string();
        let queue = Queue::new(vec![newer, older], Vec::new(), Vec::new());
        let first = select_next(&queue, &RoutingPolicy::default(), &AgentStats::default());
        let second = select_next(&queue, &RoutingPolicy::default(), &AgentStats::default());
        assert_eq!(first.as_ref().map(|i| i.id.as_str()), Some("B"));
        assert_eq!(first, second);
    }
}
