//! A small task-graph executor with AND-combinator dependencies.
//!
//! A task becomes ready when all of its predecessors are complete. Tasks
//! may return [`TaskStatus::Incomplete`] to be re-polled on a later sweep,
//! which is how the suspending receive of an exchange is driven to
//! completion.

use derive_more::{From, Into};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::ExchangeError;

/// Completion state of one task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task finished; dependents may run.
    Complete,
    /// The task must be polled again.
    Incomplete,
}

/// Identifier of a task within a [`TaskList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, From, Into)]
pub struct TaskId(NodeIndex);

type TaskFn<C> = Box<dyn FnMut(&mut C) -> Result<TaskStatus, ExchangeError>>;

struct TaskNode<C> {
    name: String,
    run: TaskFn<C>,
    status: Option<TaskStatus>,
}

/// A directed acyclic graph of tasks over a shared context `C`.
pub struct TaskList<C> {
    graph: DiGraph<TaskNode<C>, ()>,
}

impl<C> Default for TaskList<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TaskList<C> {
    /// Create an empty task list.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
        }
    }

    /// Add a task that runs after all of `deps` are complete.
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        deps: &[TaskId],
        run: impl FnMut(&mut C) -> Result<TaskStatus, ExchangeError> + 'static,
    ) -> TaskId {
        let id = self.graph.add_node(TaskNode {
            name: name.into(),
            run: Box::new(run),
            status: None,
        });
        for dep in deps {
            self.graph.add_edge(dep.0, id, ());
        }
        TaskId(id)
    }

    /// Add a dependency between two existing tasks.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.graph.add_edge(depends_on.0, task.0, ());
    }

    /// Number of tasks in the list.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the list has no tasks.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Run every task to completion, re-polling incomplete ones.
    ///
    /// Statuses are reset at entry, so a list can be executed once per
    /// cycle. Fails if a sweep finds work left but nothing ready to run.
    pub fn execute(&mut self, ctx: &mut C) -> Result<(), ExchangeError> {
        for node in self.graph.node_weights_mut() {
            node.status = None;
        }
        let total = self.graph.node_count();
        let mut completed = 0usize;
        while completed < total {
            let mut ran = false;
            let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
            for idx in indices {
                if self.graph[idx].status == Some(TaskStatus::Complete) {
                    continue;
                }
                let ready = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|dep| self.graph[dep].status == Some(TaskStatus::Complete));
                if !ready {
                    continue;
                }
                let node = &mut self.graph[idx];
                let status = (node.run)(ctx)?;
                node.status = Some(status);
                ran = true;
                if status == TaskStatus::Complete {
                    completed += 1;
                }
            }
            if !ran {
                let task = self
                    .graph
                    .node_weights()
                    .find(|n| n.status != Some(TaskStatus::Complete))
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                return Err(ExchangeError::DependencyCycle { task });
            }
        }
        Ok(())
    }
}
