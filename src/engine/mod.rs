//! Task graph with two kinds of edges.
//!
//! A `DependsOn` edge forces the dependency into every invocation that needs
//! the dependent, and a failure travels along it. A `MustRunAfter` edge only
//! orders two tasks that are both scheduled anyway; it never schedules
//! anything and never propagates failure.

mod runner;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::error::{GraphError, TaskError};

pub use runner::{BuildReport, SkipReason, TaskExecution, TaskRecord, TaskState};

/// What a finished action reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The action did its work.
    Executed,
    /// The inputs did not change since the last successful run.
    UpToDate,
    /// There was nothing to work on.
    NoSource,
}

/// Passed to every running action.
pub struct TaskContext<'a> {
    pub name: &'a str,
    /// Span of the running task, carrying its progress indicator.
    pub span: tracing::Span,
}

pub type Action = Arc<dyn Fn(&TaskContext<'_>) -> Result<Outcome, TaskError> + Send + Sync>;

#[derive(Clone)]
pub struct Task {
    name: String,
    group: String,
    description: String,
    action: Option<Action>,
    enabled: bool,
    outputs: Vec<Utf8PathBuf>,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Tasks without an action only aggregate their dependencies.
    pub fn is_aggregate(&self) -> bool {
        self.action.is_none()
    }

    pub fn outputs(&self) -> &[Utf8PathBuf] {
        &self.outputs
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("enabled", &self.enabled)
            .field("aggregate", &self.is_aggregate())
            .field("outputs", &self.outputs)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    DependsOn,
    MustRunAfter,
}

/// Collects tasks and edges. Every problem with the declaration surfaces from
/// [`GraphBuilder::finish`], before anything runs.
#[derive(Default)]
pub struct GraphBuilder {
    graph: petgraph::Graph<Task, Edge>,
    names: HashMap<String, NodeIndex>,
    edges: Vec<(String, String, Edge)>,
    error: Option<GraphError>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the definition of a task named `name`.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            builder: self,
            task: Task {
                name: name.into(),
                group: String::new(),
                description: String::new(),
                action: None,
                enabled: true,
                outputs: Vec::new(),
            },
        }
    }

    /// `task` cannot start before `dependency` succeeded, and requesting
    /// `task` schedules `dependency` too.
    pub fn depends_on(&mut self, task: &str, dependency: &str) -> &mut Self {
        self.edges
            .push((dependency.to_string(), task.to_string(), Edge::DependsOn));
        self
    }

    /// If both are scheduled, `task` starts only after `predecessor` ended.
    pub fn must_run_after(&mut self, task: &str, predecessor: &str) -> &mut Self {
        self.edges
            .push((predecessor.to_string(), task.to_string(), Edge::MustRunAfter));
        self
    }

    fn add(&mut self, task: Task) {
        if self.names.contains_key(&task.name) {
            self.error
                .get_or_insert(GraphError::DuplicateTask(task.name.clone()));
            return;
        }

        let name = task.name.clone();
        let index = self.graph.add_node(task);
        self.names.insert(name, index);
    }

    fn lookup(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask(name.to_string()))
    }

    /// Wires the edges and runs the static checks: unknown or self
    /// referencing edges, two enabled tasks writing the same output, cycles.
    pub fn finish(mut self) -> Result<Graph, GraphError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        for (source, target, edge) in std::mem::take(&mut self.edges) {
            if source == target {
                return Err(GraphError::SelfEdge(source));
            }
            let source = self.lookup(&source)?;
            let target = self.lookup(&target)?;
            let exists = self
                .graph
                .edges_connecting(source, target)
                .any(|existing| *existing.weight() == edge);
            if !exists {
                self.graph.add_edge(source, target, edge);
            }
        }

        let mut writers: HashMap<&Utf8Path, &str> = HashMap::new();
        for task in self.graph.node_weights().filter(|task| task.enabled) {
            for output in &task.outputs {
                if let Some(first) = writers.insert(output, &task.name) {
                    return Err(GraphError::DuplicateOutput {
                        path: output.clone(),
                        first: first.to_string(),
                        second: task.name.clone(),
                    });
                }
            }
        }

        petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].name.clone()))?;

        Ok(Graph {
            graph: self.graph,
            names: self.names,
        })
    }
}

/// A task under construction.
pub struct TaskDef<'a> {
    builder: &'a mut GraphBuilder,
    task: Task,
}

impl<'a> TaskDef<'a> {
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.task.group = group.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.task.description = description.into();
        self
    }

    /// Declares a path only this task writes.
    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.task.outputs.push(path.into());
        self
    }

    /// Keeps the task in the graph but never runs it.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.task.enabled = enabled;
        self
    }

    pub fn run<F>(mut self, action: F)
    where
        F: Fn(&TaskContext<'_>) -> Result<Outcome, TaskError> + Send + Sync + 'static,
    {
        self.task.action = Some(Arc::new(action));
        self.builder.add(self.task);
    }

    /// Registers the task as a pure aggregation point.
    pub fn aggregate(self) {
        self.builder.add(self.task);
    }
}

/// A validated, immutable task graph.
pub struct Graph {
    graph: petgraph::Graph<Task, Edge>,
    names: HashMap<String, NodeIndex>,
}

impl Graph {
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.names.get(name).map(|&index| &self.graph[index])
    }

    /// Tasks in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    fn index(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTask(name.to_string()))
    }

    fn edges_directed(
        &self,
        index: NodeIndex,
        direction: Direction,
        kind: Edge,
    ) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .edges_directed(index, direction)
            .filter(move |edge| *edge.weight() == kind)
            .map(move |edge| match direction {
                Direction::Incoming => edge.source(),
                Direction::Outgoing => edge.target(),
            })
    }

    /// Hard dependencies of `name`, direct ones only.
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>, GraphError> {
        let index = self.index(name)?;
        let mut names: Vec<_> = self
            .edges_directed(index, Direction::Incoming, Edge::DependsOn)
            .map(|dep| self.graph[dep].name.as_str())
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    /// `targets` and everything they transitively hard-depend on.
    pub(crate) fn closure(&self, targets: &[&str]) -> Result<HashSet<NodeIndex>, GraphError> {
        let mut scheduled = HashSet::new();
        let mut stack = targets
            .iter()
            .map(|name| self.index(name))
            .collect::<Result<Vec<_>, _>>()?;

        while let Some(index) = stack.pop() {
            if scheduled.insert(index) {
                stack.extend(self.edges_directed(index, Direction::Incoming, Edge::DependsOn));
            }
        }

        Ok(scheduled)
    }

    fn write_edges(&self, f: &mut impl fmt::Write) -> fmt::Result {
        for edge in self.graph.edge_references() {
            let (source, target) = (edge.source().index(), edge.target().index());
            match edge.weight() {
                Edge::DependsOn => writeln!(f, "    {source} --> {target}")?,
                Edge::MustRunAfter => writeln!(f, "    {source} -. after .-> {target}")?,
            }
        }

        Ok(())
    }

    /// Names of the tasks requesting `targets` would schedule, sorted.
    pub fn plan(&self, targets: &[&str]) -> Result<Vec<&str>, GraphError> {
        let mut names: Vec<_> = self
            .closure(targets)?
            .into_iter()
            .map(|index| self.graph[index].name.as_str())
            .collect();
        names.sort_unstable();
        Ok(names)
    }
}

impl fmt::Display for Graph {
    /// Mermaid flowchart; dotted arrows are ordering-only edges.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;

            if !task.enabled {
                writeln!(f, "    style {} stroke-dasharray: 5 5", index.index())?;
            }
        }

        self.write_edges(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(builder: &mut GraphBuilder, name: &str) {
        builder.task(name).run(|_| Ok(Outcome::Executed));
    }

    #[test]
    fn test_duplicate_task() {
        let mut builder = GraphBuilder::new();
        noop(&mut builder, "a");
        noop(&mut builder, "a");

        assert!(matches!(builder.finish(), Err(GraphError::DuplicateTask(name)) if name == "a"));
    }

    #[test]
    fn test_unknown_and_self_edges() {
        let mut builder = GraphBuilder::new();
        noop(&mut builder, "a");
        builder.depends_on("a", "missing");
        assert!(matches!(builder.finish(), Err(GraphError::UnknownTask(name)) if name == "missing"));

        let mut builder = GraphBuilder::new();
        noop(&mut builder, "a");
        builder.must_run_after("a", "a");
        assert!(matches!(builder.finish(), Err(GraphError::SelfEdge(_))));
    }

    #[test]
    fn test_duplicate_output_is_rejected_statically() {
        let mut builder = GraphBuilder::new();
        builder
            .task("shadowJar")
            .output("build/libs/demo.jar")
            .run(|_| Ok(Outcome::Executed));
        builder
            .task("other")
            .output("build/libs/demo.jar")
            .run(|_| Ok(Outcome::Executed));

        match builder.finish() {
            Err(GraphError::DuplicateOutput { path, first, second }) => {
                assert_eq!(path, "build/libs/demo.jar");
                assert_eq!(first, "shadowJar");
                assert_eq!(second, "other");
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_disabled_task_may_share_output() {
        let mut builder = GraphBuilder::new();
        builder
            .task("shadowJar")
            .output("build/libs/demo.jar")
            .run(|_| Ok(Outcome::Executed));
        builder
            .task("jar")
            .output("build/libs/demo.jar")
            .enabled(false)
            .run(|_| Ok(Outcome::Executed));

        builder.finish().unwrap();
    }

    #[test]
    fn test_cycle_through_ordering_edge() {
        let mut builder = GraphBuilder::new();
        noop(&mut builder, "a");
        noop(&mut builder, "b");
        builder.depends_on("b", "a").must_run_after("a", "b");

        assert!(matches!(builder.finish(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_closure_follows_hard_edges_only() {
        let mut builder = GraphBuilder::new();
        for name in ["compile", "build", "deploy", "buildAndDeploy"] {
            noop(&mut builder, name);
        }
        builder
            .depends_on("build", "compile")
            .depends_on("deploy", "compile")
            .depends_on("buildAndDeploy", "build")
            .depends_on("buildAndDeploy", "deploy")
            .must_run_after("deploy", "build");
        let graph = builder.finish().unwrap();

        assert_eq!(graph.plan(&["deploy"]).unwrap(), ["compile", "deploy"]);
        assert_eq!(
            graph.plan(&["buildAndDeploy"]).unwrap(),
            ["build", "buildAndDeploy", "compile", "deploy"]
        );
        assert_eq!(graph.dependencies("buildAndDeploy").unwrap(), ["build", "deploy"]);

        let mermaid = graph.to_string();
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("-. after .->"));
    }
}
