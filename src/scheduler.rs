mod report;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::blueprint::TaskGraph;
use crate::core::Config;
use crate::error::{GraphCycleError, PipelineError, SetupError, ToolInvocationError};
use crate::placement::{Prepared, prepare};
use crate::task::Task;
use crate::tool::Executor;

pub use report::{BatchReport, Failure, TaskOutcome};

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Why a task ended without running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Every output already exists.
    UpToDate,
    /// A dependency failed, directly or further up. Holds its name.
    UpstreamFailed(String),
    /// The run was interrupted before the task could be dispatched.
    Interrupted,
}

/// Lifecycle of a task. Only the coordinator changes it, and terminal
/// states never change again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    /// Holds the diagnostic.
    Failed(String),
    Skipped(SkipReason),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed(_) | TaskState::Skipped(_)
        )
    }

    /// Whether dependents may run after this state.
    fn satisfies(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Skipped(SkipReason::UpToDate)
        )
    }
}

/// Executes a [`TaskGraph`] on a fixed pool of worker threads.
#[derive(Debug, Clone)]
pub struct Scheduler {
    workers: usize,
    remove_existing: bool,
    interrupt: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        Self {
            workers: config.workers(),
            remove_existing: config.remove_existing,
            interrupt: Arc::default(),
        }
    }

    /// Shares `flag` with whoever handles interrupts, e.g. a signal handler.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    /// Raising this flag stops new dispatches. Tasks already running finish.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Runs every task of `graph` as soon as its dependencies are satisfied.
    ///
    /// Workers only execute tasks. Everything else happens on the calling
    /// thread, which owns the task states:
    /// 1. Tasks without dependencies are queued as ready.
    /// 2. Before dispatch, the outputs of a ready task are prepared. A task
    ///    whose outputs all exist is skipped as up to date.
    /// 3. Finished tasks report back through a channel. Success releases the
    ///    dependents, failure skips them and everything below them.
    /// 4. The loop ends once nothing is ready or running.
    pub fn run(&self, graph: &TaskGraph, executor: &dyn Executor) -> Result<BatchReport, PipelineError> {
        let started = Instant::now();
        let total = graph.len();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("petdeface-worker-{i}"))
            .build()
            .map_err(SetupError::Pool)?;

        let root_span = tracing::span!(Level::INFO, "running_tasks");
        root_span.pb_set_length(total as u64);
        root_span.pb_set_style(&crate::io::progress_style());
        root_span.pb_set_message("Defacing...");
        let _enter = root_span.enter();

        let task_style = crate::io::task_style();
        let mut coordinator = Coordinator::new(graph);

        // The coordinator runs on this thread, so a single worker never waits on it.
        pool.in_place_scope(|s| -> Result<(), GraphCycleError> {
            let (sender, receiver) =
                channel::<(NodeIndex, Result<(), ToolInvocationError>, TaskExecution)>();

            let mut running = 0;
            let mut dispatched = 0;
            let mut reported = 0;

            loop {
                while !self.interrupted()
                    && let Some(index) = coordinator.ready.pop_front()
                {
                    dispatched += 1;
                    if dispatched > total {
                        return Err(coordinator.cycle(dispatched));
                    }

                    let task = graph.task(index);

                    match self.prepare_outputs(task) {
                        Ok(true) => {
                            tracing::info!("{task} is up to date");
                            coordinator.finish(index, TaskState::Skipped(SkipReason::UpToDate));
                            advance(&root_span, &mut reported, coordinator.finished);
                            continue;
                        }
                        Ok(false) => {}
                        Err(diagnostic) => {
                            tracing::error!("{task} failed: {diagnostic}");
                            coordinator.finish(index, TaskState::Failed(diagnostic));
                            advance(&root_span, &mut reported, coordinator.finished);
                            continue;
                        }
                    }

                    coordinator.states[index.index()] = TaskState::Running;
                    running += 1;

                    let sender = sender.clone();
                    let task_style = task_style.clone();
                    let parent = root_span.clone();

                    s.spawn(move |_| {
                        let span =
                            tracing::span!(parent: &parent, Level::INFO, "task", name = task.name());
                        span.pb_set_style(&task_style);
                        span.pb_set_message(&format!("Running {task}"));
                        let _enter = span.enter();

                        let start = Instant::now();
                        let result = execute(executor, task);
                        let execution = TaskExecution {
                            start,
                            duration: start.elapsed(),
                        };

                        // The coordinator outlives every worker of the scope.
                        let _ = sender.send((index, result, execution));
                    });
                }

                if running == 0 {
                    break;
                }

                let Ok((index, result, execution)) = receiver.recv() else {
                    break;
                };

                running -= 1;
                coordinator.timings[index.index()] = Some(execution);

                let task = graph.task(index);
                match result {
                    Ok(()) => {
                        tracing::info!(
                            "{task} finished {}",
                            crate::io::as_overhead(execution.start)
                        );
                        coordinator.finish(index, TaskState::Succeeded);
                    }
                    Err(err) => {
                        tracing::error!("{task} failed: {err}");
                        coordinator.finish(index, TaskState::Failed(err.to_string()));
                    }
                }

                // cascaded skips count as finished too
                advance(&root_span, &mut reported, coordinator.finished);
            }

            if coordinator.finished < total && !self.interrupted() {
                return Err(coordinator.cycle(dispatched));
            }

            Ok(())
        })?;

        if self.interrupted() {
            tracing::warn!("interrupted, {} tasks not run", total - coordinator.finished);
        }

        Ok(coordinator.into_report(started.elapsed()))
    }

    /// Creates output directories and deals with outputs of a previous run.
    /// Returns whether the task can be skipped.
    fn prepare_outputs(&self, task: &Task) -> Result<bool, String> {
        let produced = task.produced();
        let mut up_to_date = !produced.is_empty();

        for output in task.outputs() {
            let owned = produced.contains(&output);
            match prepare(output, self.remove_existing && owned) {
                Ok(Prepared::Existing) => {}
                Ok(Prepared::Fresh) => up_to_date &= !owned,
                Err(err) => return Err(err.to_string()),
            }
        }

        Ok(up_to_date)
    }
}

/// Moves the progress bar up to `finished`.
fn advance(span: &tracing::Span, reported: &mut usize, finished: usize) {
    span.pb_inc((finished - *reported) as u64);
    *reported = finished;
}

/// Runs one task on a worker, turning panics and missing outputs into errors.
fn execute(executor: &dyn Executor, task: &Task) -> Result<(), ToolInvocationError> {
    // The executor only sees the task by shared reference, a panic leaves
    // nothing half-updated behind.
    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        executor.execute(task)
    })) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };

            Err(ToolInvocationError::Panic(msg))
        }
    };

    result?;

    match task.outputs().into_iter().find(|output| !output.exists()) {
        Some(missing) => Err(ToolInvocationError::MissingOutput(missing.to_path_buf())),
        None => Ok(()),
    }
}

/// Task states and the ready queue, owned by the scheduling thread.
struct Coordinator<'g> {
    graph: &'g TaskGraph,
    states: Vec<TaskState>,
    timings: Vec<Option<TaskExecution>>,
    /// Unfinished dependencies per task.
    remaining: Vec<usize>,
    dependents: HashMap<NodeIndex, Vec<NodeIndex>>,
    ready: VecDeque<NodeIndex>,
    finished: usize,
    /// Failed and failure-skipped tasks, in the order they ended.
    failures: Vec<NodeIndex>,
}

impl<'g> Coordinator<'g> {
    fn new(graph: &'g TaskGraph) -> Self {
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        let mut remaining = vec![0; graph.len()];

        for (dependency, dependent) in graph.edges() {
            dependents.entry(dependency).or_default().push(dependent);
            remaining[dependent.index()] += 1;
        }

        let mut states = vec![TaskState::Pending; graph.len()];
        let mut ready = VecDeque::new();

        for index in graph.indices() {
            if remaining[index.index()] == 0 {
                states[index.index()] = TaskState::Ready;
                ready.push_back(index);
            }
        }

        Self {
            graph,
            states,
            timings: vec![None; graph.len()],
            remaining,
            dependents,
            ready,
            finished: 0,
            failures: Vec::new(),
        }
    }

    /// Moves a task into a terminal state and updates its dependents.
    fn finish(&mut self, index: NodeIndex, state: TaskState) {
        debug_assert!(!self.states[index.index()].is_terminal());

        let satisfied = state.satisfies();
        if !satisfied {
            self.failures.push(index);
        }

        self.states[index.index()] = state;
        self.finished += 1;

        if satisfied {
            self.release(index);
        } else {
            self.cascade(index);
        }
    }

    fn release(&mut self, index: NodeIndex) {
        let Some(dependents) = self.dependents.get(&index) else {
            return;
        };

        for &dependent in dependents {
            let count = &mut self.remaining[dependent.index()];
            *count -= 1;

            if *count == 0 && self.states[dependent.index()] == TaskState::Pending {
                self.states[dependent.index()] = TaskState::Ready;
                self.ready.push_back(dependent);
            }
        }
    }

    /// Skips every transitive dependent of a failed task.
    fn cascade(&mut self, failed: NodeIndex) {
        let cause = self.graph.task(failed).name();
        let mut queue = VecDeque::from([failed]);

        while let Some(index) = queue.pop_front() {
            let Some(dependents) = self.dependents.get(&index) else {
                continue;
            };

            for &dependent in dependents {
                if self.states[dependent.index()].is_terminal() {
                    continue;
                }

                tracing::warn!("{} skipped, {cause} failed", self.graph.task(dependent));
                self.states[dependent.index()] =
                    TaskState::Skipped(SkipReason::UpstreamFailed(cause.clone()));
                self.finished += 1;
                self.failures.push(dependent);
                queue.push_back(dependent);
            }
        }
    }

    fn cycle(&self, dispatched: usize) -> GraphCycleError {
        GraphCycleError {
            dispatched,
            finished: self.finished,
            total: self.graph.len(),
        }
    }

    fn into_report(mut self, elapsed: Duration) -> BatchReport {
        for state in &mut self.states {
            if !state.is_terminal() {
                *state = TaskState::Skipped(SkipReason::Interrupted);
            }
        }

        BatchReport::new(
            self.graph,
            self.states,
            self.timings,
            self.failures,
            elapsed,
        )
    }
}
