use std::collections::{HashMap, HashSet};

use super::PlanTask;
use crate::error::{FleetError, Result};

/// Validate a task list as a dependency DAG: every dependency must name a
/// task in the list and the graph must be acyclic.
pub(crate) fn validate_dependencies(tasks: &[PlanTask]) -> Result<()> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    if ids.len() != tasks.len() {
        return Err(FleetError::PlanValidation("duplicate task ids".to_string()));
    }

    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(FleetError::PlanValidation(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
        }
        graph.insert(
            task.id.as_str(),
            task.dependencies.iter().map(String::as_str).collect(),
        );
    }

    if let Some(cycle) = detect_cycle(&graph) {
        return Err(FleetError::PlanValidation(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }
    Ok(())
}

fn detect_cycle<'a>(graph: &HashMap<&'a str, Vec<&'a str>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node in graph.keys() {
        if dfs_cycle(node, graph, &mut visited, &mut rec_stack, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<String>,
) -> bool {
    if rec_stack.contains(node) {
        path.push(node.to_string());
        return true;
    }
    if visited.contains(node) {
        return false;
    }

    visited.insert(node);
    rec_stack.insert(node);
    path.push(node.to_string());

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if dfs_cycle(dep, graph, visited, rec_stack, path) {
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> PlanTask {
        PlanTask {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            scope: Default::default(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            affected_files: Vec::new(),
            constraints: Vec::new(),
            shared_context: None,
            issue_number: None,
            issue_url: None,
            session_id: None,
            error: None,
        }
    }

    #[test]
    fn diamond_is_valid() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ];
        assert!(validate_dependencies(&tasks).is_ok());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let tasks = vec![task("a", &["ghost"])];
        let err = validate_dependencies(&tasks).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn cycle_is_rejected() {
        let tasks = vec![task("a", &["b"]), task("b", &["c"]), task("c", &["a"])];
        assert!(validate_dependencies(&tasks).is_err());
    }

    #[test]
    fn self_dependency_is_rejected() {
        let tasks = vec![task("a", &["a"])];
        assert!(validate_dependencies(&tasks).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tasks = vec![task("a", &[]), task("a", &[])];
        assert!(validate_dependencies(&tasks).is_err());
    }
}
