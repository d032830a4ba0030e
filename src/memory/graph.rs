//! Iterative traversals over the edge table: neighbours, shortest paths and
//! cycle checks. Every walk keeps a visited set and a depth cap.

use anyhow::Result;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet, VecDeque};

use super::edges::get_edges;
use super::model::{Direction, Edge, EdgeKind};
use crate::error::MemoryError;

/// Upper bound on any traversal depth.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub node_id: String,
    pub edge: Edge,
}

pub fn neighbors(
    conn: &Connection,
    node_id: &str,
    kinds: Option<&[EdgeKind]>,
    direction: Direction,
) -> Result<Vec<Neighbor>> {
    let edges = get_edges(conn, node_id, direction, kinds)?;
    Ok(edges
        .into_iter()
        .map(|edge| {
            let other = if edge.from_id == node_id {
                edge.to_id.clone()
            } else {
                edge.from_id.clone()
            };
            Neighbor {
                node_id: other,
                edge,
            }
        })
        .collect())
}

fn out_ids(conn: &Connection, node_id: &str, kinds: Option<&[EdgeKind]>) -> Result<Vec<String>> {
    Ok(get_edges(conn, node_id, Direction::Out, kinds)?
        .into_iter()
        .map(|e| e.to_id)
        .collect())
}

/// Breadth-first search from `start` to `goal` over `successors`.
/// Returns the node sequence including both ends.
pub fn find_path<F>(start: &str, goal: &str, max_depth: usize, mut successors: F) -> Result<Option<Vec<String>>>
where
    F: FnMut(&str) -> Result<Vec<String>>,
{
    if start == goal {
        return Ok(Some(vec![start.to_string()]));
    }
    let mut parent: HashMap<String, String> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::from([start.to_string()]);
    let mut queue: VecDeque<(String, usize)> = VecDeque::from([(start.to_string(), 0)]);

    while let Some((node, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let mut next = successors(&node)?;
        next.sort();
        for succ in next {
            if !seen.insert(succ.clone()) {
                continue;
            }
            parent.insert(succ.clone(), node.clone());
            if succ == goal {
                let mut path = vec![succ];
                let mut cur = goal.to_string();
                while let Some(p) = parent.get(&cur) {
                    path.push(p.clone());
                    cur = p.clone();
                }
                path.reverse();
                return Ok(Some(path));
            }
            queue.push_back((succ, depth + 1));
        }
    }
    Ok(None)
}

/// Every shortest path from `from` to `to` no longer than `max_len` edges,
/// in lexicographic order. Used to answer "why does X depend on Y".
pub fn shortest_paths(
    conn: &Connection,
    from: &str,
    to: &str,
    max_len: usize,
    kinds: Option<&[EdgeKind]>,
) -> Result<Vec<Vec<String>>> {
    let max_len = max_len.min(MAX_DEPTH);
    if from == to {
        return Ok(vec![vec![from.to_string()]]);
    }
    // level-synchronous BFS keeping every parent at the shortest distance
    let mut dist: HashMap<String, usize> = HashMap::from([(from.to_string(), 0)]);
    let mut parents: HashMap<String, Vec<String>> = HashMap::new();
    let mut frontier = vec![from.to_string()];
    let mut depth = 0;
    let mut found = false;

    while !frontier.is_empty() && depth < max_len && !found {
        depth += 1;
        let mut next_frontier = Vec::new();
        for node in &frontier {
            for succ in out_ids(conn, node, kinds)? {
                match dist.get(&succ) {
                    Some(&d) if d < depth => continue,
                    Some(_) => {}
                    None => {
                        dist.insert(succ.clone(), depth);
                        next_frontier.push(succ.clone());
                    }
                }
                parents.entry(succ.clone()).or_default().push(node.clone());
                if succ == to {
                    found = true;
                }
            }
        }
        frontier = next_frontier;
    }
    if !found {
        return Ok(Vec::new());
    }

    // unwind parents from the goal with an explicit stack
    let mut paths = Vec::new();
    let mut stack: Vec<Vec<String>> = vec![vec![to.to_string()]];
    while let Some(partial) = stack.pop() {
        let head = partial.last().cloned().unwrap_or_default();
        if head == from {
            let mut p = partial;
            p.reverse();
            paths.push(p);
            continue;
        }
        if let Some(ps) = parents.get(&head) {
            for p in ps {
                let mut extended = partial.clone();
                extended.push(p.clone());
                stack.push(extended);
            }
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Reject `extra` if, together with existing dependency edges, it closes a
/// cycle. The reported path starts and ends at `extra.from_id`.
pub fn cycle_check(conn: &Connection, extra: &Edge) -> Result<()> {
    if !extra.kind.is_dependency() {
        return Ok(());
    }
    if extra.from_id == extra.to_id {
        return Err(MemoryError::CycleWould {
            path: vec![extra.from_id.clone(), extra.to_id.clone()],
        }
        .into());
    }
    let deps = [EdgeKind::DependsOn, EdgeKind::Calls];
    let back = find_path(&extra.to_id, &extra.from_id, MAX_DEPTH, |n| {
        out_ids(conn, n, Some(&deps[..]))
    })?;
    if let Some(back) = back {
        let mut path = vec![extra.from_id.clone()];
        path.extend(back);
        return Err(MemoryError::CycleWould { path }.into());
    }
    Ok(())
}
