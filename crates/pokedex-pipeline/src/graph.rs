//! Task dependency graph
//!
//! Nodes are typed task ids, edges are "depends on" relations. The graph owns
//! every task's state and answers the one scheduling question the
//! orchestrator needs: have all dependencies of a task succeeded?

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::error::GraphError;
use crate::model::CatalogReference;

/// Identifier of one node in the pipeline graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    ListCatalog,
    FetchDetail(i32),
    ProvisionSchema,
    LoadBatch,
}

impl TaskId {
    /// Entity id for fetch tasks
    pub fn entity_id(&self) -> Option<i32> {
        match self {
            TaskId::FetchDetail(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::ListCatalog => f.write_str("list_catalog"),
            TaskId::FetchDetail(id) => write!(f, "fetch_detail[{id}]"),
            TaskId::ProvisionSchema => f.write_str("provision_schema"),
            TaskId::LoadBatch => f.write_str("load_batch"),
        }
    }
}

/// Lifecycle of one task: `Pending -> Running -> {Succeeded, Failed}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed(_))
    }
}

/// A failed task and the error it ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: TaskId,
    pub error: String,
}

#[derive(Debug, Clone)]
struct TaskNode {
    depends_on: BTreeSet<TaskId>,
    state: TaskState,
}

/// Explicit task graph with per-task state
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: BTreeMap<TaskId, TaskNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full run before fan-out: listing, provisioning, and the load gated on
    /// both. Fetch nodes are added by [`TaskGraph::expand_fan_out`].
    pub fn full_run() -> Result<Self, GraphError> {
        let mut graph = Self::new();
        graph.add_task(TaskId::ListCatalog, [])?;
        graph.add_task(TaskId::ProvisionSchema, [])?;
        graph.add_task(TaskId::LoadBatch, [TaskId::ListCatalog, TaskId::ProvisionSchema])?;
        Ok(graph)
    }

    /// Load-stage retry: provisioning followed by the load
    pub fn load_only() -> Result<Self, GraphError> {
        let mut graph = Self::new();
        graph.add_task(TaskId::ProvisionSchema, [])?;
        graph.add_task(TaskId::LoadBatch, [TaskId::ProvisionSchema])?;
        Ok(graph)
    }

    /// Add a task; every dependency must already be present
    pub fn add_task(
        &mut self,
        task: TaskId,
        depends_on: impl IntoIterator<Item = TaskId>,
    ) -> Result<(), GraphError> {
        if self.nodes.contains_key(&task) {
            return Err(GraphError::DuplicateTask(task));
        }

        let depends_on: BTreeSet<TaskId> = depends_on.into_iter().collect();
        if let Some(missing) = depends_on.iter().find(|dep| !self.nodes.contains_key(dep)) {
            return Err(GraphError::UnknownDependency {
                task,
                dependency: *missing,
            });
        }

        self.nodes.insert(
            task,
            TaskNode {
                depends_on,
                state: TaskState::Pending,
            },
        );
        Ok(())
    }

    /// Add an edge between existing tasks, rejecting edges that close a cycle
    pub fn add_dependency(&mut self, task: TaskId, dependency: TaskId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&dependency) {
            return Err(GraphError::UnknownDependency { task, dependency });
        }
        let node = self.nodes.get_mut(&task).ok_or(GraphError::UnknownTask(task))?;
        if !node.depends_on.insert(dependency) {
            return Ok(());
        }

        if let Err(err) = self.topological_order() {
            if let Some(node) = self.nodes.get_mut(&task) {
                node.depends_on.remove(&dependency);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Add one fetch task per reference after the listing, each gating the load
    ///
    /// A fresh fetch node has no dependents, so the edge into `load_batch`
    /// cannot close a cycle and skips the full check.
    pub fn expand_fan_out(&mut self, references: &[CatalogReference]) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&TaskId::LoadBatch) {
            return Err(GraphError::UnknownTask(TaskId::LoadBatch));
        }

        for reference in references {
            let task = TaskId::FetchDetail(reference.id);
            self.add_task(task, [TaskId::ListCatalog])?;
            if let Some(load) = self.nodes.get_mut(&TaskId::LoadBatch) {
                load.depends_on.insert(task);
            }
        }
        Ok(())
    }

    /// Kahn's algorithm in O(V + E); ties are broken by task id so the order
    /// is stable
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        let mut dependents: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            for dep in &node.depends_on {
                dependents.entry(*dep).or_default().push(*id);
            }
        }

        let mut remaining: BTreeMap<TaskId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.depends_on.len()))
            .collect();
        let mut ready: VecDeque<TaskId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(task) = ready.pop_front() {
            remaining.remove(&task);
            order.push(task);
            for id in dependents.get(&task).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(id) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*id);
                    }
                }
            }
        }

        match remaining.keys().next() {
            Some(stuck) => Err(GraphError::Cycle(*stuck)),
            None => Ok(order),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn state(&self, task: TaskId) -> Option<&TaskState> {
        self.nodes.get(&task).map(|node| &node.state)
    }

    pub fn dependencies(&self, task: TaskId) -> Option<impl Iterator<Item = TaskId> + '_> {
        self.nodes.get(&task).map(|node| node.depends_on.iter().copied())
    }

    /// Move a task to a new state, allowing only forward transitions
    pub fn transition(&mut self, task: TaskId, next: TaskState) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&task).ok_or(GraphError::UnknownTask(task))?;

        let allowed = matches!(
            (&node.state, &next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed(_))
        );
        if !allowed {
            return Err(GraphError::InvalidTransition {
                task,
                from: node.state.as_str(),
                to: next.as_str(),
            });
        }

        node.state = next;
        Ok(())
    }

    /// True once every dependency of `task` has succeeded
    pub fn barrier_satisfied(&self, task: TaskId) -> bool {
        self.nodes.get(&task).is_some_and(|node| {
            node.depends_on
                .iter()
                .all(|dep| matches!(self.state(*dep), Some(TaskState::Succeeded)))
        })
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| match &node.state {
                TaskState::Failed(error) => Some(TaskFailure {
                    task: *id,
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Tasks that never left `Pending`
    pub fn pending_tasks(&self) -> Vec<TaskId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.state == TaskState::Pending)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot of every task's state in id order
    pub fn states(&self) -> Vec<(TaskId, TaskState)> {
        self.nodes
            .iter()
            .map(|(id, node)| (*id, node.state.clone()))
            .collect()
    }
}
