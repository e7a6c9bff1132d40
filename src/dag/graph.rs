// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::dot::{Config, Dot};
use petgraph::graphmap::DiGraphMap;

use crate::dag::{Task, TaskName};
use crate::errors::{Result, RundagError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Validated, acyclic task graph.
///
/// Besides the tasks themselves this keeps the reverse adjacency
/// (`dependents`) and a deterministic topological order used as a
/// scheduling tie-break.
#[derive(Debug, Clone)]
pub struct Dag {
    tasks: BTreeMap<TaskName, Task>,
    dependents: BTreeMap<TaskName, BTreeSet<TaskName>>,
    order: Vec<TaskName>,
    rank: HashMap<TaskName, usize>,
}

impl Dag {
    /// Validate `tasks` and build the graph.
    ///
    /// Checks run in order: duplicate names, unresolved dependencies, cycles.
    pub fn build(tasks: Vec<Task>) -> Result<Dag> {
        let mut by_name: BTreeMap<TaskName, Task> = BTreeMap::new();
        for task in tasks {
            if by_name.contains_key(&task.name) {
                return Err(RundagError::DuplicateTask(task.name));
            }
            by_name.insert(task.name.clone(), task);
        }

        for task in by_name.values() {
            for dep in &task.dependencies {
                if !by_name.contains_key(dep) {
                    return Err(RundagError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let deps: BTreeMap<&str, Vec<&str>> = by_name
            .iter()
            .map(|(name, task)| {
                (
                    name.as_str(),
                    task.dependencies.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        if let Some(members) = find_cycle(&deps) {
            return Err(RundagError::DagCycle { members });
        }

        let mut dependents: BTreeMap<TaskName, BTreeSet<TaskName>> = by_name
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for task in by_name.values() {
            for dep in &task.dependencies {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(task.name.clone());
                }
            }
        }

        let order = topological_order(&by_name, &dependents);
        let rank = order
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        Ok(Dag {
            tasks: by_name,
            dependents,
            order,
            rank,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// Tasks in name order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<TaskName>> {
        self.tasks.get(name).map(|t| &t.dependencies)
    }

    pub fn dependents_of(&self, name: &str) -> Option<&BTreeSet<TaskName>> {
        self.dependents.get(name)
    }

    /// All transitive dependents of `name`, excluding `name` itself.
    pub fn descendants_of(&self, name: &str) -> BTreeSet<TaskName> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![name];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        stack.push(child);
                    }
                }
            }
        }
        seen
    }

    /// Tasks without dependencies.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.tasks
            .values()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.name.as_str())
    }

    /// Deterministic topological order (Kahn, lexical tie-break).
    pub fn order_hint(&self) -> &[TaskName] {
        &self.order
    }

    /// Position of `name` in [`Dag::order_hint`].
    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.rank.get(name).copied()
    }

    /// Graphviz rendering with edges pointing from dependency to dependent.
    pub fn to_dot(&self) -> String {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in &self.order {
            graph.add_node(name.as_str());
        }
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                graph.add_edge(dep.as_str(), task.name.as_str(), ());
            }
        }
        format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}

/// Depth-first search with three colours. Returns the members of the first
/// cycle found, in path order starting at the node that closes it.
///
/// Nodes and their dependency lists are visited in key order so the
/// reported cycle is stable across runs.
pub(crate) fn find_cycle(deps: &BTreeMap<&str, Vec<&str>>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = deps.keys().map(|&k| (k, Mark::Unvisited)).collect();

    for &start in deps.keys() {
        if marks.get(start) != Some(&Mark::Unvisited) {
            continue;
        }

        // Explicit stack of (node, index of next dependency to visit).
        let mut path: Vec<&str> = vec![start];
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::InProgress);

        while let Some((node, next)) = stack.last_mut() {
            let node = *node;
            let children = deps.get(node).map(Vec::as_slice).unwrap_or(&[]);

            if *next >= children.len() {
                marks.insert(node, Mark::Done);
                stack.pop();
                path.pop();
                continue;
            }

            let child = children[*next];
            *next += 1;

            match marks.get(child).copied().unwrap_or(Mark::Done) {
                Mark::Unvisited => {
                    marks.insert(child, Mark::InProgress);
                    path.push(child);
                    stack.push((child, 0));
                }
                Mark::InProgress => {
                    let pos = path.iter().position(|&n| n == child).unwrap_or(0);
                    return Some(path[pos..].iter().map(|s| s.to_string()).collect());
                }
                Mark::Done => {}
            }
        }
    }

    None
}

fn topological_order(
    tasks: &BTreeMap<TaskName, Task>,
    dependents: &BTreeMap<TaskName, BTreeSet<TaskName>>,
) -> Vec<TaskName> {
    let mut indegree: BTreeMap<&str, usize> = tasks
        .iter()
        .map(|(name, task)| (name.as_str(), task.dependencies.len()))
        .collect();

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        if let Some(children) = dependents.get(name) {
            for child in children {
                if let Some(d) = indegree.get_mut(child.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(child.as_str());
                    }
                }
            }
        }
    }
    order
}
