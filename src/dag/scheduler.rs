// src/dag/scheduler.rs

//! Pure scheduling decisions over a [`Dag`].
//!
//! None of these functions hold state; the run loop owns the `completed`,
//! `in_flight` and `failed` sets and lends them here on every iteration.

use std::collections::BTreeSet;

use crate::dag::{Dag, TaskName};

/// Tasks whose dependencies have all completed and that are neither
/// completed nor in flight.
pub fn eligible_tasks(
    dag: &Dag,
    completed: &BTreeSet<TaskName>,
    in_flight: &BTreeSet<TaskName>,
) -> BTreeSet<TaskName> {
    dag.tasks()
        .filter(|task| !completed.contains(&task.name) && !in_flight.contains(&task.name))
        .filter(|task| task.dependencies.iter().all(|dep| completed.contains(dep)))
        .map(|task| task.name.clone())
        .collect()
}

/// [`eligible_tasks`] sorted by the DAG's topological order hint.
pub fn ordered_eligible(
    dag: &Dag,
    completed: &BTreeSet<TaskName>,
    in_flight: &BTreeSet<TaskName>,
) -> Vec<TaskName> {
    let mut ready: Vec<TaskName> = eligible_tasks(dag, completed, in_flight)
        .into_iter()
        .collect();
    ready.sort_by_key(|name| dag.rank_of(name).unwrap_or(usize::MAX));
    ready
}

/// Every transitive dependent of the terminally failed tasks.
pub fn blocked_by(dag: &Dag, failed: &BTreeSet<TaskName>) -> BTreeSet<TaskName> {
    failed
        .iter()
        .flat_map(|name| dag.descendants_of(name))
        .collect()
}
