#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
pub mod container;
mod core;
mod dataset;
mod error;
mod io;
mod placement;
pub mod qa;
mod scheduler;
mod select;
mod task;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;
mod tool;
#[cfg(feature = "logging")]
mod utils;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use camino::Utf8PathBuf;

pub use crate::blueprint::{Blueprint, GraphOptions, Template, TaskGraph, build_graph};
pub use crate::core::{BIDS_VERSION, Config, PIPELINE, PlacementMode, Selection, TemplateAnat, Toolchain};
pub use crate::dataset::{
    Acquisition, AcquisitionKind, DESCRIPTOR, DatasetIndex, Descriptor, FileName, Session, Subject,
};
pub use crate::error::*;
pub use crate::io::{as_overhead, mirror_dataset, write_derivatives_descriptor};
pub use crate::placement::{Artifact, Placement, PlacementPlan, Prepared, Stage, prepare};
pub use crate::scheduler::{
    BatchReport, Failure, Scheduler, SkipReason, TaskExecution, TaskOutcome, TaskState,
};
pub use crate::select::{WorkSet, select};
pub use crate::task::{Task, TaskKind};
pub use crate::tool::{Executor, Invocation, validate_dataset};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// File name of the Mermaid rendering of the executed graph.
pub const GRAPH_FILE: &str = "petdeface_graph.mmd";

/// What a finished run left behind.
#[derive(Debug)]
pub struct RunSummary {
    pub report: BatchReport,
    pub graph_file: Utf8PathBuf,
    pub qa_page: Option<Utf8PathBuf>,
}

impl RunSummary {
    /// Process exit status: 0 when every selected subject was processed and
    /// every task succeeded or was up to date.
    pub fn exit_code(&self) -> u8 {
        if self.report.is_success() { 0 } else { 1 }
    }
}

/// Checks that must pass before any task is dispatched with the real
/// toolchain: the FreeSurfer license and, unless skipped, the dataset
/// validator.
pub fn preflight(config: &Config) -> Result<(), SetupError> {
    let license = config.toolchain.license_path()?;
    tracing::debug!("using FreeSurfer license {license}");

    if config.skip_validator {
        tracing::info!("skipping dataset validation");
    } else {
        let s = Instant::now();
        validate_dataset(&config.toolchain, config.input_dir())?;
        tracing::info!("dataset is valid {}", as_overhead(s));
    }

    Ok(())
}

/// Template for subjects without a T1w image, resolved only when a selected
/// subject actually needs one.
fn resolve_template(config: &Config, work: &WorkSet) -> Result<Option<Template>, SetupError> {
    let Some(kind) = config.template else {
        return Ok(None);
    };

    if !work.subjects.iter().any(Subject::needs_template) {
        tracing::debug!("no selected subject needs the {} template", kind.as_str());
        return Ok(None);
    }

    let image = config.toolchain.template_path(kind)?;
    Ok(Some(Template { kind, image }))
}

/// Scans, selects, plans and executes a whole batch.
///
/// This will:
/// 1. Index the input dataset and apply the subject/session filters.
/// 2. Build the task graph.
/// 3. Prepare the output roots (metadata mirror, derivatives descriptor).
/// 4. Execute the graph with `executor`.
/// 5. Write the graph rendering and, with previews, the QA page.
///
/// Task failures do not make this fail; they are in the returned report.
pub fn run(config: &Config, executor: &dyn Executor) -> Result<RunSummary, PipelineError> {
    run_with_interrupt(config, executor, Arc::default())
}

/// Like [`run`], but stops dispatching new tasks once `interrupt` is raised.
/// Tasks already running finish and the outputs are still written.
pub fn run_with_interrupt(
    config: &Config,
    executor: &dyn Executor,
    interrupt: Arc<AtomicBool>,
) -> Result<RunSummary, PipelineError> {
    let s = Instant::now();
    let index = DatasetIndex::build(config.input_dir())?;
    let work = select(&index, &config.selection)?;
    tracing::info!("indexed {} {}", config.input_dir(), as_overhead(s));

    let template = resolve_template(config, &work)?;
    let placement = Placement::new(config);
    let graph = build_graph(&work, &placement, &GraphOptions::new(config, template));

    if placement.mode() == PlacementMode::Adjacent {
        mirror_dataset(&index, placement.primary_root())?;
    }
    write_derivatives_descriptor(&index, placement.derivatives_root())?;

    let report = Scheduler::new(config)
        .with_interrupt(interrupt)
        .run(&graph, executor)?;

    let graph_file = placement.derivatives_root().join(GRAPH_FILE);
    report.render_mermaid_to_file(&graph_file)?;

    let qa_page = if config.preview {
        qa::write_qa_page(&report, placement.derivatives_root())?
    } else {
        None
    };

    if config.open_browser {
        match &qa_page {
            Some(page) => {
                if let Err(err) = qa::open_in_browser(page) {
                    tracing::warn!("couldn't open the QA page: {err}");
                }
            }
            None => tracing::warn!("--open_browser has no effect without --preview_pics"),
        }
    }

    tracing::info!("Batch finished\n{report}");

    Ok(RunSummary {
        report,
        graph_file,
        qa_page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, Scripted};

    #[test]
    fn test_template_resolved_only_when_needed() {
        let fixture = Fixture::new();
        fixture.anat("01", None);
        fixture.pet("01", None, None);

        let mut config = Config::new(fixture.root());
        // t1 without --template_t1 would be a setup error
        config.template = Some(TemplateAnat::T1);

        let index = DatasetIndex::build(fixture.root()).unwrap();
        let work = select(&index, &config.selection).unwrap();
        assert!(resolve_template(&config, &work).unwrap().is_none());

        fixture.pet("02", None, None);
        let index = DatasetIndex::build(fixture.root()).unwrap();
        let work = select(&index, &config.selection).unwrap();
        assert!(matches!(
            resolve_template(&config, &work),
            Err(SetupError::TemplateUnset)
        ));
    }

    #[test]
    fn test_unprocessable_subject_fails_the_run() {
        let fixture = Fixture::new();
        fixture.pet("02", None, None);

        let executor = Scripted::default();
        let summary = run(&Config::new(fixture.root()), &executor).unwrap();

        assert!(summary.report.outcomes.is_empty());
        assert_eq!(summary.report.unprocessable, vec!["02".to_string()]);
        assert_eq!(summary.exit_code(), 1);
        assert!(executor.ran().is_empty());
    }

    #[test]
    fn test_preflight_requires_license() {
        let fixture = Fixture::new();
        let config = Config::new(fixture.root());
        assert!(matches!(preflight(&config), Err(SetupError::License)));
    }

    #[test]
    fn test_run_writes_graph_and_descriptor() {
        let fixture = Fixture::new();
        fixture.anat("01", None);
        fixture.pet("01", None, None);

        let config = Config::new(fixture.root());
        let summary = run(&config, &Scripted::default()).unwrap();

        assert_eq!(summary.exit_code(), 0);
        let derivatives = fixture.defaced().join("derivatives/petdeface");
        assert_eq!(summary.graph_file, derivatives.join(GRAPH_FILE));
        assert!(summary.graph_file.is_file());
        assert!(derivatives.join(DESCRIPTOR).is_file());
        assert!(summary.qa_page.is_none());
    }
}
