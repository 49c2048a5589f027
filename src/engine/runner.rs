use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use super::{Edge, Graph, Outcome, TaskContext};
use crate::error::{GraphError, TaskError};

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UpToDate,
    Disabled,
    NoSource,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::UpToDate => "up to date",
            SkipReason::Disabled => "disabled",
            SkipReason::NoSource => "no source",
        })
    }
}

#[derive(Debug, Clone)]
pub enum TaskState {
    /// Every predecessor is done, the task can start.
    Pending,
    /// Waiting for at least one predecessor.
    Blocked,
    Running,
    Succeeded,
    Skipped(SkipReason),
    Failed(Arc<TaskError>),
    /// Never ran because a hard dependency failed; `cause` names the task
    /// whose action failed.
    Propagated { cause: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TaskState::Pending | TaskState::Blocked | TaskState::Running
        )
    }

    /// Succeeded or skipped, so hard dependents may run.
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Skipped(_))
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => f.write_str("pending"),
            TaskState::Blocked => f.write_str("blocked"),
            TaskState::Running => f.write_str("running"),
            TaskState::Succeeded => f.write_str("succeeded"),
            TaskState::Skipped(reason) => write!(f, "skipped ({reason})"),
            TaskState::Failed(_) => f.write_str("failed"),
            TaskState::Propagated { cause } => write!(f, "not run ('{cause}' failed)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    index: NodeIndex,
    pub name: String,
    pub state: TaskState,
    /// Present when the task's action was invoked.
    pub execution: Option<TaskExecution>,
}

/// Outcome of one invocation of the graph.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Scheduled tasks in the order they reached a terminal state.
    pub records: Vec<TaskRecord>,
}

impl BuildReport {
    /// Every scheduled task succeeded or was skipped.
    pub fn is_success(&self) -> bool {
        self.records.iter().all(|record| record.state.is_ok())
    }

    pub fn state(&self, name: &str) -> Option<&TaskState> {
        self.records
            .iter()
            .find(|record| record.name == name)
            .map(|record| &record.state)
    }

    /// Completion position of `name`, if it was scheduled.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|record| record.name == name)
    }

    pub fn first_failure(&self) -> Option<(&str, &Arc<TaskError>)> {
        self.records.iter().find_map(|record| match &record.state {
            TaskState::Failed(error) => Some((record.name.as_str(), error)),
            _ => None,
        })
    }

    /// Tasks that never ran because a hard dependency failed.
    pub fn propagated(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|record| matches!(record.state, TaskState::Propagated { .. }))
            .map(|record| record.name.as_str())
            .collect()
    }

    /// Renders the task graph as a Mermaid diagram, colored by outcome.
    ///
    /// * **Green to red**: executed, by duration
    /// * **Blue**: skipped or aggregate
    /// * **Red**: failed
    /// * **Gray**: not run because of a failure
    ///
    /// Tasks outside this invocation are left unstyled.
    pub fn render_mermaid(&self, graph: &Graph) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(&mut f, graph);
        f
    }

    fn write_mermaid(&self, f: &mut String, graph: &Graph) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let records: HashMap<NodeIndex, &TaskRecord> = self
            .records
            .iter()
            .map(|record| (record.index, record))
            .collect();

        let executed = || {
            self.records
                .iter()
                .filter(|record| matches!(record.state, TaskState::Succeeded))
                .filter_map(|record| record.execution)
                .map(|execution| execution.duration.as_secs_f64())
        };
        let min_time = executed().fold(f64::MAX, f64::min);
        let mut max_time = executed().fold(f64::MIN, f64::max);
        if (max_time - min_time).abs() < f64::EPSILON || min_time > max_time {
            max_time = min_time + 1.0;
        }

        for index in graph.graph.node_indices() {
            let name = graph.graph[index].name.replace('"', "\\\"");

            let Some(record) = records.get(&index) else {
                writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
                continue;
            };

            let (label, color) = match (&record.state, record.execution) {
                (TaskState::Succeeded, Some(execution)) => {
                    let t = (execution.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    let t = t.clamp(0.0, 1.0);

                    // Green (0, 255, 0) -> Yellow (255, 255, 0) -> Red (255, 0, 0)
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };

                    (
                        format!("{:.2?}", execution.duration),
                        format!("#{:02X}{:02X}00", r, g),
                    )
                }
                (TaskState::Failed(_), _) => ("Failed".to_string(), "#FF6B6B".to_string()),
                (TaskState::Propagated { .. }, _) => {
                    ("Not run".to_string(), "#D3D3D3".to_string())
                }
                (state, _) => (state.to_string(), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label)?;
            writeln!(f, "    style {} fill:{}", index.index(), color)?;
        }

        graph.write_edges(f)
    }
}

/// Bookkeeping of the coordinating thread.
struct Schedule<'g> {
    graph: &'g Graph,
    scheduled: HashSet<NodeIndex>,
    /// Unfinished scheduled predecessors, over both edge kinds.
    counts: HashMap<NodeIndex, usize>,
    states: HashMap<NodeIndex, TaskState>,
    ready: Vec<NodeIndex>,
    records: Vec<TaskRecord>,
}

impl<'g> Schedule<'g> {
    fn new(graph: &'g Graph, scheduled: HashSet<NodeIndex>) -> Self {
        let counts: HashMap<NodeIndex, usize> = scheduled
            .iter()
            .map(|&index| {
                let count = graph
                    .graph
                    .edges_directed(index, Direction::Incoming)
                    .filter(|edge| scheduled.contains(&edge.source()))
                    .count();
                (index, count)
            })
            .collect();

        let states = counts
            .iter()
            .map(|(&index, &count)| {
                let state = match count {
                    0 => TaskState::Pending,
                    _ => TaskState::Blocked,
                };
                (index, state)
            })
            .collect();

        // Popped from the back, so the earliest registered task starts first.
        let mut ready: Vec<_> = counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&index, _)| index)
            .collect();
        ready.sort_unstable_by(|a, b| b.cmp(a));

        Self {
            graph,
            scheduled,
            counts,
            states,
            ready,
            records: Vec::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.records.len() == self.scheduled.len()
    }

    /// The failed task behind a failed hard dependency of `index`, if any.
    /// Disabled dependencies are looked through.
    fn failed_dependency(&self, index: NodeIndex) -> Option<String> {
        self.graph
            .edges_directed(index, Direction::Incoming, Edge::DependsOn)
            .find_map(|dependency| match self.states.get(&dependency)? {
                TaskState::Failed(_) => Some(self.graph.graph[dependency].name.clone()),
                TaskState::Propagated { cause } => Some(cause.clone()),
                TaskState::Skipped(SkipReason::Disabled) => self.failed_dependency(dependency),
                _ => None,
            })
    }

    /// Settles `index` without running its action, if it never needs to run.
    fn settle(&self, index: NodeIndex) -> Option<TaskState> {
        let task = &self.graph.graph[index];

        if !task.enabled {
            return Some(TaskState::Skipped(SkipReason::Disabled));
        }
        if let Some(cause) = self.failed_dependency(index) {
            tracing::warn!("Skipping {}: '{}' failed", task.name, cause);
            return Some(TaskState::Propagated { cause });
        }
        if task.action.is_none() {
            return Some(TaskState::Succeeded);
        }

        None
    }

    fn finish(&mut self, index: NodeIndex, state: TaskState, execution: Option<TaskExecution>) {
        debug_assert!(state.is_terminal());
        self.states.insert(index, state.clone());
        self.records.push(TaskRecord {
            index,
            name: self.graph.graph[index].name.clone(),
            state,
            execution,
        });

        for target in self.graph.graph.neighbors_directed(index, Direction::Outgoing) {
            if let Some(count) = self.counts.get_mut(&target) {
                *count -= 1;
                if *count == 0 {
                    self.states.insert(target, TaskState::Pending);
                    self.ready.push(target);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

impl Graph {
    /// Runs `targets` and everything they hard-depend on, on at most `jobs`
    /// worker threads (`0` picks one per core).
    ///
    /// The calling thread coordinates: a task is handed to the pool once all
    /// of its scheduled predecessors reached a terminal state. A failure
    /// marks every transitive hard dependent as not run; independent
    /// branches keep going. Task failures end up in the report, only a
    /// problem with the request itself is an error.
    pub fn run(&self, targets: &[&str], jobs: usize) -> Result<BuildReport, GraphError> {
        let scheduled = self.closure(targets)?;
        if scheduled.is_empty() {
            return Ok(BuildReport::default());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("shadepack-worker-{i}"))
            .build()?;

        let root_span = tracing::span!(Level::INFO, "running_tasks");
        root_span.pb_set_length(scheduled.len() as u64);
        root_span.pb_set_style(&crate::utils::progress_style());
        root_span.pb_set_message("Running tasks...");
        let _enter = root_span.enter();

        let task_style = crate::utils::task_style();
        let mut schedule = Schedule::new(self, scheduled);

        pool.in_place_scope(|s| {
            // (index, result, execution)
            let (sender, receiver) =
                channel::<(NodeIndex, Result<Outcome, TaskError>, TaskExecution)>();
            let mut running = 0usize;

            loop {
                while let Some(index) = schedule.ready.pop() {
                    if let Some(state) = schedule.settle(index) {
                        schedule.finish(index, state, None);
                        root_span.pb_inc(1);
                        continue;
                    }

                    let task = &self.graph[index];
                    let Some(action) = task.action.clone() else {
                        continue;
                    };
                    let name = task.name.clone();
                    let sender = sender.clone();
                    let task_style = task_style.clone();

                    schedule.states.insert(index, TaskState::Running);
                    running += 1;

                    s.spawn(move |_| {
                        let span = tracing::span!(Level::INFO, "task", name = %name);
                        span.pb_set_style(&task_style);
                        span.pb_set_message(&format!("Running {}", name));
                        let _enter = span.enter();

                        let context = TaskContext {
                            name: &name,
                            span: span.clone(),
                        };

                        let start = Instant::now();
                        // The action only sees shared state through its own
                        // synchronisation, a panic cannot leave it half-updated.
                        let result = catch_unwind(AssertUnwindSafe(|| action(&context)))
                            .unwrap_or_else(|panic| Err(TaskError::Panic(panic_message(&*panic))));
                        let duration = start.elapsed();

                        sender
                            .send((index, result, TaskExecution { start, duration }))
                            .expect("scheduler stopped listening");
                    });
                }

                if running == 0 || schedule.is_done() {
                    break;
                }

                let (index, result, execution) =
                    receiver.recv().expect("all workers hung up");
                running -= 1;

                let name = &self.graph[index].name;
                let state = match result {
                    Ok(Outcome::Executed) => TaskState::Succeeded,
                    Ok(Outcome::UpToDate) => TaskState::Skipped(SkipReason::UpToDate),
                    Ok(Outcome::NoSource) => TaskState::Skipped(SkipReason::NoSource),
                    Err(error) => {
                        tracing::error!("Task '{}' failed: {}", name, error);
                        TaskState::Failed(Arc::new(error))
                    }
                };
                tracing::debug!(task = %name, state = %state, "Task finished in {:.2?}", execution.duration);

                schedule.finish(index, state, Some(execution));
                root_span.pb_inc(1);
            }
        });

        let report = BuildReport {
            records: schedule.records,
        };
        if report.is_success() {
            tracing::info!("Build complete!");
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    use super::*;
    use crate::engine::GraphBuilder;

    fn fails(message: &'static str) -> impl Fn(&TaskContext<'_>) -> Result<Outcome, TaskError> {
        move |_| Err(TaskError::Other(anyhow::anyhow!(message)))
    }

    #[test]
    fn test_failure_propagates_along_hard_edges_only() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut builder = GraphBuilder::new();

        builder.task("compileJava").run(fails("cannot find symbol"));
        for name in ["shadowJar", "deploy", "compileTest"] {
            let ran = ran.clone();
            builder.task(name).run(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Executed)
            });
        }
        builder
            .depends_on("shadowJar", "compileJava")
            .depends_on("deploy", "shadowJar")
            .must_run_after("compileTest", "compileJava");
        let graph = builder.finish().unwrap();

        let report = graph.run(&["deploy", "compileTest"], 2).unwrap();

        assert!(!report.is_success());
        assert!(matches!(report.state("compileJava"), Some(TaskState::Failed(_))));
        assert!(
            matches!(report.state("deploy"), Some(TaskState::Propagated { cause }) if cause == "compileJava")
        );
        assert!(matches!(report.state("compileTest"), Some(TaskState::Succeeded)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let (task, error) = report.first_failure().unwrap();
        assert_eq!(task, "compileJava");
        assert!(error.to_string().contains("cannot find symbol"));

        let mut propagated = report.propagated();
        propagated.sort_unstable();
        assert_eq!(propagated, ["deploy", "shadowJar"]);
    }

    #[test]
    fn test_must_run_after_orders_without_scheduling() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut builder = GraphBuilder::new();

        for (name, delay) in [("compile", 0), ("build", 40), ("deploy", 0)] {
            let order = order.clone();
            builder.task(name).run(move |ctx| {
                sleep(Duration::from_millis(delay));
                order.lock().unwrap().push(ctx.name.to_string());
                Ok(Outcome::Executed)
            });
        }
        builder.task("buildAndDeploy").aggregate();
        builder
            .depends_on("build", "compile")
            .depends_on("deploy", "compile")
            .depends_on("buildAndDeploy", "build")
            .depends_on("buildAndDeploy", "deploy")
            .must_run_after("deploy", "build");
        let graph = builder.finish().unwrap();

        let report = graph.run(&["buildAndDeploy"], 4).unwrap();
        assert!(report.is_success());
        assert_eq!(*order.lock().unwrap(), ["compile", "build", "deploy"]);
        assert!(report.position("build") < report.position("deploy"));

        order.lock().unwrap().clear();
        let report = graph.run(&["deploy"], 4).unwrap();
        assert!(report.is_success());
        assert!(report.state("build").is_none());
        assert_eq!(*order.lock().unwrap(), ["compile", "deploy"]);
    }

    #[test]
    fn test_aggregate_and_disabled_tasks() {
        let mut builder = GraphBuilder::new();
        builder.task("compileJava").run(|_| Ok(Outcome::UpToDate));
        builder.task("compileTest").run(|_| Ok(Outcome::NoSource));
        builder
            .task("jar")
            .enabled(false)
            .run(|_| panic!("disabled tasks never run"));
        builder.task("build").aggregate();
        builder
            .depends_on("build", "compileJava")
            .depends_on("build", "compileTest")
            .depends_on("build", "jar");
        let graph = builder.finish().unwrap();

        let report = graph.run(&["build"], 1).unwrap();

        assert!(report.is_success());
        assert!(matches!(report.state("build"), Some(TaskState::Succeeded)));
        assert!(matches!(report.state("jar"), Some(TaskState::Skipped(SkipReason::Disabled))));
        assert!(matches!(
            report.state("compileJava"),
            Some(TaskState::Skipped(SkipReason::UpToDate))
        ));
        assert!(matches!(
            report.state("compileTest"),
            Some(TaskState::Skipped(SkipReason::NoSource))
        ));
        assert_eq!(report.position("build"), Some(3));
    }

    #[test]
    fn test_failure_propagates_through_disabled_task() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut builder = GraphBuilder::new();
        builder.task("a").run(fails("broken"));
        builder
            .task("b")
            .enabled(false)
            .run(|_| panic!("disabled tasks never run"));
        let counter = ran.clone();
        builder.task("c").run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Executed)
        });
        builder.depends_on("b", "a").depends_on("c", "b");
        let graph = builder.finish().unwrap();

        let report = graph.run(&["c"], 1).unwrap();

        assert!(matches!(report.state("a"), Some(TaskState::Failed(_))));
        assert!(matches!(report.state("b"), Some(TaskState::Skipped(SkipReason::Disabled))));
        assert!(matches!(
            report.state("c"),
            Some(TaskState::Propagated { cause }) if cause == "a"
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(report.propagated(), ["c"]);
    }

    #[test]
    fn test_panic_is_a_task_failure() {
        let mut builder = GraphBuilder::new();
        builder.task("relocate").run(|_| panic!("boom"));
        builder.task("build").aggregate();
        builder.depends_on("build", "relocate");
        let graph = builder.finish().unwrap();

        let report = graph.run(&["build"], 1).unwrap();

        match report.state("relocate") {
            Some(TaskState::Failed(error)) => {
                assert!(matches!(&**error, TaskError::Panic(message) if message == "boom"))
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(matches!(report.state("build"), Some(TaskState::Propagated { .. })));
    }

    #[test]
    fn test_unknown_target() {
        let graph = GraphBuilder::new().finish().unwrap();
        assert!(matches!(
            graph.run(&["nope"], 1),
            Err(GraphError::UnknownTask(_))
        ));
        assert!(graph.run(&[], 1).unwrap().records.is_empty());
    }

    #[test]
    fn test_render_mermaid() {
        let mut builder = GraphBuilder::new();
        builder.task("resolve").run(|_| Ok(Outcome::Executed));
        builder.task("compileJava").run(fails("broken"));
        builder.task("shadowJar").run(|_| Ok(Outcome::Executed));
        builder.task("jar").enabled(false).run(|_| Ok(Outcome::Executed));
        builder
            .depends_on("compileJava", "resolve")
            .depends_on("shadowJar", "compileJava");
        let graph = builder.finish().unwrap();

        let report = graph.run(&["shadowJar"], 2).unwrap();
        let mermaid = report.render_mermaid(&graph);

        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("1[\"compileJava\\nFailed\"]"));
        assert!(mermaid.contains("style 1 fill:#FF6B6B"));
        assert!(mermaid.contains("style 2 fill:#D3D3D3"));
        assert!(mermaid.contains("    3[\"jar\"]\n"));
        assert!(mermaid.contains("0 --> 1"));
    }
}
