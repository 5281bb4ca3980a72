use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use flowline_core::error::{FlowError, Result};
use flowline_core::workflow::{NodeConfig, NodeKind, WorkflowDefinition};

/// Longest run timeout a definition may declare (100 years).
pub const MAX_TIMEOUT_SECS: u64 = 100 * 365 * 86_400;

/// Check the structural invariants of a definition.
///
/// A valid definition has unique node and edge ids, exactly one trigger
/// with no incoming edges, edges that only reference declared nodes,
/// condition branches tagged `"true"` or `"false"`, every node reachable
/// from the trigger, and no cycles.
pub fn validate(def: &WorkflowDefinition) -> Result<()> {
    if let Some(secs) = def.settings.timeout_seconds.filter(|s| *s > MAX_TIMEOUT_SECS) {
        return Err(structure(format!(
            "timeout_seconds {} exceeds the maximum of {}",
            secs, MAX_TIMEOUT_SECS
        )));
    }

    let mut ids = HashSet::new();
    for node in &def.nodes {
        if node.id.is_empty() {
            return Err(structure("node with empty id"));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(structure(format!("duplicate node id '{}'", node.id)));
        }
    }

    let triggers: Vec<&str> = def
        .nodes
        .iter()
        .filter(|n| n.kind() == NodeKind::Trigger)
        .map(|n| n.id.as_str())
        .collect();
    let trigger = match triggers.as_slice() {
        [one] => *one,
        [] => return Err(structure("workflow has no trigger node")),
        many => {
            return Err(structure(format!(
                "workflow has {} trigger nodes ({})",
                many.len(),
                many.join(", ")
            )))
        }
    };

    let kinds: HashMap<&str, NodeKind> =
        def.nodes.iter().map(|n| (n.id.as_str(), n.kind())).collect();

    let mut edge_ids = HashSet::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(structure(format!("duplicate edge id '{}'", edge.id)));
        }
        let Some(source_kind) = kinds.get(edge.source.as_str()) else {
            return Err(structure(format!(
                "edge '{}' references missing source node '{}'",
                edge.id, edge.source
            )));
        };
        if !kinds.contains_key(edge.target.as_str()) {
            return Err(structure(format!(
                "edge '{}' references missing target node '{}'",
                edge.id, edge.target
            )));
        }
        if edge.target == trigger {
            return Err(structure(format!("edge '{}' points at the trigger", edge.id)));
        }
        if *source_kind == NodeKind::Condition {
            if let Some(tag) = edge.condition.as_deref() {
                if tag != "true" && tag != "false" {
                    return Err(structure(format!(
                        "edge '{}' has branch tag '{}'; expected \"true\" or \"false\"",
                        edge.id, tag
                    )));
                }
            }
        }
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    // Forward BFS from the trigger
    let mut seen = HashSet::from([trigger]);
    let mut queue = VecDeque::from([trigger]);
    while let Some(id) = queue.pop_front() {
        for next in adjacency.get(id).into_iter().flatten() {
            if seen.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    if let Some(orphan) = def.nodes.iter().find(|n| !seen.contains(n.id.as_str())) {
        return Err(structure(format!(
            "node '{}' is unreachable from trigger '{}'",
            orphan.id, trigger
        )));
    }

    if let Some(node) = find_cycle(trigger, &adjacency) {
        return Err(structure(format!("cycle detected through node '{}'", node)));
    }

    for node in &def.nodes {
        if let NodeConfig::Trigger(t) = &node.config {
            if let Some(expr) = &t.schedule {
                cron::Schedule::from_str(expr).map_err(|e| {
                    structure(format!("trigger '{}' has invalid schedule '{}': {}", node.id, expr, e))
                })?;
            }
        }
    }

    Ok(())
}

fn structure(msg: impl Into<String>) -> FlowError {
    FlowError::Structure(msg.into())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Iterative three-colour DFS. Returns a node on the first back edge found.
fn find_cycle<'a>(start: &'a str, adjacency: &HashMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
    marks.insert(start, Mark::Visiting);

    while let Some((node, idx)) = stack.last_mut() {
        let children = adjacency.get(*node).map(Vec::as_slice).unwrap_or(&[]);
        if let Some(&child) = children.get(*idx) {
            *idx += 1;
            match marks.get(child) {
                Some(Mark::Visiting) => return Some(child),
                Some(Mark::Done) => {}
                None => {
                    marks.insert(child, Mark::Visiting);
                    stack.push((child, 0));
                }
            }
        } else {
            marks.insert(*node, Mark::Done);
            stack.pop();
        }
    }
    None
}
