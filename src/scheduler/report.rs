use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter, Write};
use std::time::Duration;

use petgraph::graph::NodeIndex;

use super::{SkipReason, TaskExecution, TaskState};
use crate::blueprint::TaskGraph;
use crate::task::Task;

/// Terminal state of one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: Task,
    pub state: TaskState,
    /// Set for tasks that were actually handed to a worker.
    pub execution: Option<TaskExecution>,
}

/// A task that failed, or was skipped because something above it failed.
#[derive(Debug, Clone)]
pub struct Failure {
    pub name: String,
    pub subject: String,
    pub session: Option<String>,
    pub kind: &'static str,
    pub state: TaskState,
    pub diagnostic: String,
}

/// Outcome of a whole batch.
///
/// Returned by [`Scheduler::run`](super::Scheduler::run). Outcomes are indexed
/// like the nodes of the graph that was run.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub outcomes: Vec<TaskOutcome>,
    /// `(dependency, dependent)` pairs of outcome indices.
    pub edges: Vec<(usize, usize)>,
    /// In the order the tasks ended.
    pub failures: Vec<Failure>,
    pub elapsed: Duration,
    /// Subjects that had nothing to register their PET data onto.
    pub unprocessable: Vec<String>,
}

impl BatchReport {
    pub(super) fn new(
        graph: &TaskGraph,
        states: Vec<TaskState>,
        timings: Vec<Option<TaskExecution>>,
        failures: Vec<NodeIndex>,
        elapsed: Duration,
    ) -> Self {
        let outcomes: Vec<TaskOutcome> = graph
            .tasks()
            .zip(states)
            .zip(timings)
            .map(|((task, state), execution)| TaskOutcome {
                task: task.clone(),
                state,
                execution,
            })
            .collect();

        let failures = failures
            .into_iter()
            .map(|index| {
                let outcome = &outcomes[index.index()];
                let diagnostic = match &outcome.state {
                    TaskState::Failed(diagnostic) => diagnostic.clone(),
                    TaskState::Skipped(SkipReason::UpstreamFailed(cause)) => {
                        format!("dependency {cause} failed")
                    }
                    other => format!("{other:?}"),
                };

                Failure {
                    name: outcome.task.name(),
                    subject: outcome.task.subject.clone(),
                    session: outcome.task.session.clone(),
                    kind: outcome.task.kind.as_str(),
                    state: outcome.state.clone(),
                    diagnostic,
                }
            })
            .collect();

        Self {
            outcomes,
            edges: graph
                .edges()
                .map(|(source, target)| (source.index(), target.index()))
                .collect(),
            failures,
            elapsed,
            unprocessable: graph.unprocessable.clone(),
        }
    }

    fn count(&self, predicate: impl Fn(&TaskState) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.state)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|state| *state == TaskState::Succeeded)
    }

    pub fn up_to_date(&self) -> usize {
        self.count(|state| *state == TaskState::Skipped(SkipReason::UpToDate))
    }

    pub fn failed(&self) -> usize {
        self.count(|state| matches!(state, TaskState::Failed(_)))
    }

    /// Tasks that never ran for any reason other than being up to date.
    pub fn skipped(&self) -> usize {
        self.count(|state| {
            matches!(state, TaskState::Skipped(reason) if *reason != SkipReason::UpToDate)
        })
    }

    /// Every task either succeeded or was already up to date, and no
    /// selected subject was left without tasks.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0 && self.unprocessable.is_empty()
    }

    /// Renders the executed task graph as a Mermaid diagram, color-coded by
    /// terminal state.
    ///
    /// * **Green**: Succeeded
    /// * **Blue**: Up to date
    /// * **Red**: Failed
    /// * **Grey**: Skipped after a failure
    /// * **Orange**: Interrupted
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, outcome) in self.outcomes.iter().enumerate() {
            let name = outcome.task.name().replace('"', "\\\"");

            let (label, color) = match &outcome.state {
                TaskState::Succeeded => {
                    let duration = outcome.execution.map(|e| e.duration).unwrap_or_default();
                    (format!("{duration:.2?}"), "#90EE90")
                }
                TaskState::Skipped(SkipReason::UpToDate) => ("Up to date".into(), "#ADD8E6"),
                TaskState::Failed(_) => ("Failed".into(), "#F08080"),
                TaskState::Skipped(SkipReason::UpstreamFailed(_)) => ("Skipped".into(), "#D3D3D3"),
                TaskState::Skipped(SkipReason::Interrupted) => ("Interrupted".into(), "#FFDAB9"),
                TaskState::Pending | TaskState::Ready | TaskState::Running => {
                    ("Unfinished".into(), "#FFFFFF")
                }
            };

            writeln!(f, "    {index}[\"{name}\\n{label}\"]")?;
            writeln!(f, "    style {index} fill:{color}")?;
        }

        for (source, target) in &self.edges {
            writeln!(f, "    {source} --> {target}")?;
        }

        Ok(())
    }

    /// Writes [`render_mermaid`](Self::render_mermaid) to a file.
    pub fn render_mermaid_to_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, self.render_mermaid())
    }
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    up_to_date: usize,
    failed: usize,
    skipped: usize,
}

impl Display for BatchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tasks in {:.2?}: {} succeeded, {} up to date, {} failed, {} skipped",
            self.outcomes.len(),
            self.elapsed,
            self.succeeded(),
            self.up_to_date(),
            self.failed(),
            self.skipped(),
        )?;

        let mut subjects: BTreeMap<&str, Tally> = BTreeMap::new();
        for outcome in &self.outcomes {
            let tally = subjects.entry(outcome.task.subject.as_str()).or_default();
            match outcome.state {
                TaskState::Succeeded => tally.succeeded += 1,
                TaskState::Skipped(SkipReason::UpToDate) => tally.up_to_date += 1,
                TaskState::Failed(_) => tally.failed += 1,
                _ => tally.skipped += 1,
            }
        }

        for (subject, tally) in &subjects {
            writeln!(
                f,
                "  sub-{subject}: {} succeeded, {} up to date, {} failed, {} skipped",
                tally.succeeded, tally.up_to_date, tally.failed, tally.skipped
            )?;
        }

        for subject in &self.unprocessable {
            writeln!(f, "  sub-{subject}: no T1w image and no template, not processed")?;
        }

        for failure in &self.failures {
            let session = failure
                .session
                .as_ref()
                .map(|s| format!(" ses-{s}"))
                .unwrap_or_default();
            writeln!(
                f,
                "  ! sub-{}{session} {}: {}",
                failure.subject, failure.name, failure.diagnostic
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn task(subject: &str, label: &str) -> Task {
        Task {
            kind: TaskKind::Register {
                moving: "/in/pet.nii.gz".into(),
                average: "/d/wavg.nii.gz".into(),
                reference: "/out/T1w.nii.gz".into(),
                transform: "/d/reg.lta".into(),
            },
            subject: subject.into(),
            session: Some("a".into()),
            label: label.into(),
        }
    }

    fn report() -> BatchReport {
        let outcome = |subject, label, state| TaskOutcome {
            task: task(subject, label),
            state,
            execution: None,
        };

        BatchReport {
            outcomes: vec![
                outcome("01", "one", TaskState::Succeeded),
                outcome("01", "two", TaskState::Skipped(SkipReason::UpToDate)),
                outcome("02", "three", TaskState::Failed("mri_coreg exited".into())),
                outcome(
                    "02",
                    "four",
                    TaskState::Skipped(SkipReason::UpstreamFailed("register:three".into())),
                ),
            ],
            edges: vec![(0, 1), (2, 3)],
            failures: vec![Failure {
                name: "register:three".into(),
                subject: "02".into(),
                session: Some("a".into()),
                kind: "register",
                state: TaskState::Failed("mri_coreg exited".into()),
                diagnostic: "mri_coreg exited".into(),
            }],
            elapsed: Duration::from_millis(1500),
            unprocessable: vec!["03".into()],
        }
    }

    #[test]
    fn test_counts() {
        let report = report();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.up_to_date(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_unprocessable_subject_is_not_a_success() {
        let mut report = report();
        report.outcomes.truncate(2);
        report.edges = vec![(0, 1)];
        report.failures.clear();
        assert!(!report.is_success());

        report.unprocessable.clear();
        assert!(report.is_success());
    }

    #[test]
    fn test_mermaid() {
        let text = report().render_mermaid();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("    0[\"register:one\\n"));
        assert!(text.contains("style 1 fill:#ADD8E6"));
        assert!(text.contains("style 2 fill:#F08080"));
        assert!(text.contains("style 3 fill:#D3D3D3"));
        assert!(text.contains("    2 --> 3"));
    }

    #[test]
    fn test_display() {
        let text = report().to_string();
        assert!(text.starts_with("4 tasks in 1.50s"));
        assert!(text.contains("sub-01: 1 succeeded, 1 up to date, 0 failed, 0 skipped"));
        assert!(text.contains("sub-02: 0 succeeded, 0 up to date, 1 failed, 1 skipped"));
        assert!(text.contains("sub-03: no T1w image"));
        assert!(text.contains("! sub-02 ses-a register:three: mri_coreg exited"));
    }
}
