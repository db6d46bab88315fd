use colony_types::{ColonyError, ColonyResult};
use std::collections::{HashMap, HashSet};

/// DFS cycle detection over a task id -> dependency-ids adjacency map. The
/// map should include both `dependencies` and `parent_id` edges for every
/// task under consideration, persisted and provisional alike.
pub fn detect_cycles(graph: &HashMap<String, Vec<String>>) -> ColonyResult<()> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut path: Vec<String> = Vec::new();

    for start in graph.keys() {
        if visited.contains(start) {
            continue;
        }
        dfs(start, graph, &mut visited, &mut path)?;
    }
    Ok(())
}

fn dfs(
    node: &str,
    graph: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> ColonyResult<()> {
    if path.contains(&node.to_string()) {
        let mut cycle = path.clone();
        cycle.push(node.to_string());
        return Err(ColonyError::CycleDetected(cycle.join(" -> ")));
    }
    if visited.contains(node) {
        return Ok(());
    }

    path.push(node.to_string());
    if let Some(deps) = graph.get(node) {
        for dep in deps {
            dfs(dep, graph, visited, path)?;
        }
    }
    path.pop();
    visited.insert(node.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_graph_passes() {
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), vec!["b".to_string()]);
        graph.insert("b".to_string(), vec![]);
        assert!(detect_cycles(&graph).is_ok());
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let mut graph = HashMap::new();
        graph.insert("a".to_string(), vec!["b".to_string()]);
        graph.insert("b".to_string(), vec!["a".to_string()]);
        assert!(matches!(detect_cycles(&graph), Err(ColonyError::CycleDetected(_))));
    }
}
