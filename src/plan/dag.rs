//! Pure graph algorithms over one plan's tasks: readiness ordering,
//! topological sort and cycle extraction. Nothing here touches storage.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{Task, TaskStatus};

/// `task id → ids it depends on`, restricted to the given tasks.
pub type DepMap = BTreeMap<String, BTreeSet<String>>;

pub fn dep_map(tasks: &[Task]) -> DepMap {
    let ids: BTreeSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    tasks
        .iter()
        .map(|t| {
            let deps = t
                .dependencies
                .iter()
                .filter(|d| ids.contains(d.as_str()))
                .cloned()
                .collect();
            (t.id.clone(), deps)
        })
        .collect()
}

/// Pending tasks whose dependencies are all completed, best first:
/// priority desc, fewest deps, oldest, id.
pub fn ready_tasks(tasks: &[Task]) -> Vec<&Task> {
    let status: HashMap<&str, TaskStatus> = tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.dependencies
                .iter()
                .all(|d| status.get(d.as_str()) == Some(&TaskStatus::Completed))
        })
        .collect();
    ready.sort_by_key(|t| (Reverse(t.priority), t.dependencies.len(), t.created_at, t.id.clone()));
    ready
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DagCheck {
    Ok { order: Vec<String> },
    Cycle { path: Vec<String> },
}

/// Kahn's algorithm; among ready nodes the smallest id goes first so the
/// order is stable. Dependencies come before their dependents.
pub fn topo_order(deps: &DepMap) -> DagCheck {
    let mut indegree: BTreeMap<&str, usize> = deps.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task, ds) in deps {
        for d in ds {
            *indegree.entry(task.as_str()).or_default() += 1;
            dependents.entry(d.as_str()).or_default().push(task.as_str());
        }
    }

    let mut queue: BTreeSet<&str> = indegree.iter().filter(|(_, n)| **n == 0).map(|(k, _)| *k).collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(next) = queue.pop_first() {
        order.push(next.to_string());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(n) = indegree.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    queue.insert(*dependent);
                }
            }
        }
    }

    if order.len() == deps.len() {
        return DagCheck::Ok { order };
    }
    let done: BTreeSet<&str> = order.iter().map(String::as_str).collect();
    let path = find_cycle(deps, &done).unwrap_or_default();
    DagCheck::Cycle { path }
}

/// First cycle reachable among the nodes not in `skip`, as a closed walk
/// along dependency edges (`[a, b, c, a]` means a depends on b ...).
/// Iterative DFS; never recurses.
pub fn find_cycle(deps: &DepMap, skip: &BTreeSet<&str>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Open,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for start in deps.keys().map(String::as_str).filter(|k| !skip.contains(k)) {
        if marks.contains_key(start) {
            continue;
        }
        let mut stack: Vec<(&str, Vec<&str>)> = vec![(start, successors(deps, start))];
        marks.insert(start, Mark::Open);
        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            let Some(next) = pending.pop() else {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            };
            match marks.get(next) {
                Some(Mark::Open) => {
                    let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    let mut path: Vec<String> = stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                    path.push(next.to_string());
                    return Some(path);
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::Open);
                    let succ = successors(deps, next);
                    stack.push((next, succ));
                }
            }
        }
    }
    None
}

/// Successors in reverse id order so `pop` visits the smallest first.
fn successors<'a>(deps: &'a DepMap, node: &str) -> Vec<&'a str> {
    deps.get(node)
        .map(|ds| ds.iter().rev().map(String::as_str).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Complexity;

    fn task(id: &str, deps: &[&str], priority: i64, created_at: i64, status: TaskStatus) -> Task {
        Task {
            id: id.into(),
            plan_id: "p".into(),
            title: id.to_uppercase(),
            description: String::new(),
            acceptance_criteria: vec![],
            complexity: Complexity::Medium,
            priority,
            status,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            parent_id: None,
            created_at,
            updated_at: created_at,
            completed_at: None,
        }
    }

    #[test]
    fn ready_order_prefers_priority_then_fewer_deps() {
        let tasks = vec![
            task("a", &[], 0, 1, TaskStatus::Completed),
            task("b", &["a"], 1, 5, TaskStatus::Pending),
            task("c", &[], 1, 9, TaskStatus::Pending),
            task("d", &[], 5, 9, TaskStatus::Pending),
            task("e", &["b"], 9, 0, TaskStatus::Pending),
            task("f", &[], 1, 9, TaskStatus::Pending),
        ];
        let ids: Vec<_> = ready_tasks(&tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "f", "b"]);
    }

    #[test]
    fn topo_order_puts_dependencies_first() {
        let tasks = vec![
            task("c", &["b"], 0, 0, TaskStatus::Pending),
            task("b", &["a"], 0, 0, TaskStatus::Pending),
            task("a", &[], 0, 0, TaskStatus::Pending),
            task("z", &[], 0, 0, TaskStatus::Pending),
        ];
        assert_eq!(
            topo_order(&dep_map(&tasks)),
            DagCheck::Ok {
                order: vec!["a".into(), "b".into(), "c".into(), "z".into()]
            }
        );
    }

    #[test]
    fn cycle_is_reported_as_closed_walk() {
        let tasks = vec![
            task("a", &["c"], 0, 0, TaskStatus::Pending),
            task("b", &["a"], 0, 0, TaskStatus::Pending),
            task("c", &["b"], 0, 0, TaskStatus::Pending),
            task("d", &[], 0, 0, TaskStatus::Pending),
        ];
        match topo_order(&dep_map(&tasks)) {
            DagCheck::Cycle { path } => assert_eq!(path, vec!["a", "c", "b", "a"]),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }
}
