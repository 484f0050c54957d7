//! End to end runs of the pipeline against datasets on disk, with the
//! external tools replaced by a scripted executor.

mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::files;
use petdeface::testing::{Fixture, Scripted};
use petdeface::{
    Config, Executor, GRAPH_FILE, PipelineError, PlacementMode, SelectionError, SkipReason, Task,
    TaskState, TemplateAnat, ToolInvocationError,
};

#[test]
fn one_anatomical_two_pet() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, Some("fdg"));
    study.pet("01", None, Some("raclopride"));

    let executor = Scripted::default();
    let summary = petdeface::run(&Config::new(study.root()), &executor).unwrap();
    let report = &summary.report;

    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(report.succeeded(), 5);
    assert!(report.is_success());
    assert_eq!(summary.exit_code(), 0);

    let anat = executor.position("anat-deface:sub-01_T1w");
    for trc in ["fdg", "raclopride"] {
        let register = executor.position(&format!("register:sub-01_trc-{trc}_pet"));
        let deface = executor.position(&format!("modality-deface:sub-01_trc-{trc}_pet"));
        assert!(anat < register);
        assert!(register < deface);
    }

    let defaced = study.defaced();
    let aux = defaced.join("derivatives/petdeface");
    assert!(defaced.join("sub-01/anat/sub-01_T1w.nii.gz").is_file());
    assert!(defaced.join("sub-01/pet/sub-01_trc-fdg_pet.nii.gz").is_file());
    assert!(aux.join("sub-01/anat/sub-01_desc-defacemask_T1w.nii.gz").is_file());
    assert!(aux.join("sub-01/pet/sub-01_trc-fdg_desc-pet2anat_pet.lta").is_file());
    assert!(aux.join("sub-01/pet/sub-01_trc-fdg_desc-wavg_pet.nii.gz").is_file());
    assert!(aux.join("sub-01/pet/sub-01_trc-fdg_desc-defaced_pet.json").is_file());
    assert!(aux.join(GRAPH_FILE).is_file());

    // sidecars are mirrored, the input stays untouched
    assert!(defaced.join("sub-01/pet/sub-01_trc-fdg_pet.json").is_file());
    let original = fs::read_to_string(study.root().join("sub-01/anat/sub-01_T1w.nii.gz")).unwrap();
    assert_eq!(original, "image");
}

#[test]
fn second_run_is_up_to_date() {
    let study = Fixture::new();
    study.anat("01", Some("baseline"));
    study.pet("01", Some("baseline"), None);

    let config = Config::new(study.root());
    petdeface::run(&config, &Scripted::default()).unwrap();

    let executor = Scripted::default();
    let summary = petdeface::run(&config, &executor).unwrap();

    assert!(executor.ran().is_empty());
    assert_eq!(summary.report.up_to_date(), 3);
    assert_eq!(summary.exit_code(), 0);

    let mut config = config;
    config.remove_existing = true;
    let executor = Scripted::default();
    let summary = petdeface::run(&config, &executor).unwrap();

    assert_eq!(executor.ran().len(), 3);
    assert_eq!(summary.report.succeeded(), 3);
}

#[test]
fn failure_skips_only_its_branch() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, Some("fdg"));
    study.pet("01", None, Some("pib"));
    study.anat("02", None);
    study.pet("02", None, None);

    let executor = Scripted::failing(["register:sub-01_trc-fdg_pet"]);
    let summary = petdeface::run(&Config::new(study.root()), &executor).unwrap();
    let report = &summary.report;

    assert_eq!(report.failed(), 1);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.succeeded(), 6);
    assert_eq!(summary.exit_code(), 1);

    let skipped = report
        .outcomes
        .iter()
        .find(|o| o.task.name() == "modality-deface:sub-01_trc-fdg_pet")
        .unwrap();
    assert_eq!(
        skipped.state,
        TaskState::Skipped(SkipReason::UpstreamFailed(
            "register:sub-01_trc-fdg_pet".into()
        ))
    );

    assert_eq!(report.failures.len(), 2);
    assert!(report.failures.iter().all(|f| f.subject == "01"));
    assert!(!executor.ran().contains(&"modality-deface:sub-01_trc-fdg_pet".to_string()));

    let defaced = study.defaced();
    assert!(!defaced.join("sub-01/pet/sub-01_trc-fdg_pet.nii.gz").exists());
    assert!(defaced.join("sub-01/pet/sub-01_trc-pib_pet.nii.gz").is_file());
    assert!(defaced.join("sub-02/pet/sub-02_pet.nii.gz").is_file());

    let graph = fs::read_to_string(&summary.graph_file).unwrap();
    assert!(graph.contains("fill:#F08080"));
    assert!(graph.contains("fill:#D3D3D3"));
}

#[test]
fn template_stands_in_for_missing_anatomical() {
    let study = Fixture::new();
    study.pet("01", Some("a"), None);
    study.pet("01", Some("b"), None);

    let home = study.scratch();
    fs::create_dir_all(home.join("average")).unwrap();
    fs::write(home.join("average/mni305.cor.mgz"), "brain").unwrap();

    let mut config = Config::new(study.root());
    config.template = Some(TemplateAnat::Mni);
    config.toolchain.freesurfer_home = Some(home);

    let executor = Scripted::default();
    let summary = petdeface::run(&config, &executor).unwrap();
    let kinds: Vec<_> = summary
        .report
        .outcomes
        .iter()
        .map(|o| o.task.kind.as_str())
        .collect();

    assert_eq!(kinds.iter().filter(|k| **k == "template-substitute").count(), 2);
    assert!(!kinds.contains(&"anat-deface"));
    assert!(summary.report.is_success());

    for ses in ["a", "b"] {
        let label = format!("sub-01_ses-{ses}_pet");
        assert!(
            executor.position(&format!("template-substitute:{label}"))
                < executor.position(&format!("register:{label}"))
        );
    }

    assert!(study
        .defaced()
        .join("derivatives/petdeface/sub-01/ses-a/anat/sub-01_ses-a_desc-mnitemplate_T1w.nii.gz")
        .is_file());
}

#[test]
fn subject_without_anatomical_or_template_is_reported() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, None);
    study.pet("02", None, None);

    let summary = petdeface::run(&Config::new(study.root()), &Scripted::default()).unwrap();

    assert_eq!(summary.report.unprocessable, vec!["02".to_string()]);
    assert!(summary.report.outcomes.iter().all(|o| o.task.subject == "01"));
    assert_eq!(summary.report.succeeded(), 3);
    assert!(!summary.report.is_success());
    assert_eq!(summary.exit_code(), 1);
}

#[test]
fn contradicting_filters_stop_before_any_task() {
    let study = Fixture::new();
    study.anat("A", None);
    study.pet("A", None, None);

    let mut config = Config::new(study.root());
    config.selection.include_subjects = vec!["A".into()];
    config.selection.exclude_subjects = vec!["sub-A".into()];

    let executor = Scripted::default();
    let err = petdeface::run(&config, &executor).unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Selection(SelectionError::Empty { .. })
    ));
    assert_eq!(err.exit_code(), 2);
    assert!(executor.ran().is_empty());
    assert!(!study.defaced().exists());
}

#[test]
fn missing_descriptor_is_a_scan_error() {
    let study = Fixture::new();
    study.anat("01", None);
    fs::remove_file(study.root().join("dataset_description.json")).unwrap();

    let err = petdeface::run(&Config::new(study.root()), &Scripted::default()).unwrap_err();
    assert!(matches!(err, PipelineError::Scan(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn derivatives_placement_keeps_everything_in_one_tree() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, None);
    let before = files(study.root());

    let mut config = Config::new(study.root());
    config.placement = PlacementMode::Derivatives;
    config.preview = true;

    let summary = petdeface::run(&config, &Scripted::default()).unwrap();
    assert!(summary.report.is_success());

    let root = study.root().join("derivatives/petdeface");
    for outcome in &summary.report.outcomes {
        for output in outcome.task.outputs() {
            assert!(output.starts_with(&root), "{output} escaped {root}");
        }
    }

    // only new files below the derivatives root, nothing changed elsewhere
    let after: Vec<_> = files(study.root())
        .into_iter()
        .filter(|path| !path.starts_with("derivatives"))
        .collect();
    assert_eq!(before, after);
    assert!(!study.defaced().exists());

    assert!(root.join("sub-01/anat/sub-01_desc-defaced_T1w.nii.gz").is_file());
    assert_eq!(summary.qa_page, Some(root.join("qa/index.html")));
    let page = fs::read_to_string(root.join("qa/index.html")).unwrap();
    assert!(page.contains("../sub-01/anat/sub-01_desc-after_T1w.png"));
}

#[test]
fn inplace_overwrites_the_originals() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, None);

    let mut config = Config::new(study.root());
    config.placement = PlacementMode::Inplace;

    let summary = petdeface::run(&config, &Scripted::default()).unwrap();
    assert!(summary.report.is_success());

    let anat = fs::read_to_string(study.root().join("sub-01/anat/sub-01_T1w.nii.gz")).unwrap();
    assert_eq!(anat, "defaced");
    let aux = study.root().join("derivatives/petdeface/sub-01/pet");
    assert!(aux.join("sub-01_desc-pet2anat_pet.lta").is_file());
    assert!(aux.join("sub-01_desc-defaced_pet.json").is_file());
    assert!(!study.defaced().exists());

    let executor = Scripted::default();
    let summary = petdeface::run(&config, &executor).unwrap();
    assert!(executor.ran().is_empty());
    assert_eq!(summary.report.up_to_date(), 3);
}

#[test]
fn anat_only_ignores_pet() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, None);

    let mut config = Config::new(study.root());
    config.anat_only = true;

    let executor = Scripted::default();
    let summary = petdeface::run(&config, &executor).unwrap();

    assert_eq!(executor.ran(), vec!["anat-deface:sub-01_T1w".to_string()]);
    assert_eq!(summary.report.outcomes.len(), 1);
}

#[test]
fn raised_interrupt_dispatches_nothing() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, None);

    let executor = Scripted::default();
    let interrupt = Arc::new(AtomicBool::new(true));
    let summary =
        petdeface::run_with_interrupt(&Config::new(study.root()), &executor, interrupt).unwrap();

    assert!(executor.ran().is_empty());
    assert_eq!(summary.report.skipped(), 3);
    assert!(summary
        .report
        .outcomes
        .iter()
        .all(|o| o.state == TaskState::Skipped(SkipReason::Interrupted)));
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.graph_file.is_file());
}

/// Raises the interrupt flag once the anatomical deface is done, the way a
/// Ctrl-C during the first task would.
struct InterruptAfterAnat {
    inner: Scripted,
    interrupt: Arc<AtomicBool>,
}

impl Executor for InterruptAfterAnat {
    fn execute(&self, task: &Task) -> Result<(), ToolInvocationError> {
        self.inner.execute(task)?;
        if task.kind.as_str() == "anat-deface" {
            self.interrupt.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn interrupt_during_a_task_lets_it_finish() {
    let study = Fixture::new();
    study.anat("01", None);
    study.pet("01", None, None);

    let mut config = Config::new(study.root());
    config.n_procs = 1;

    let interrupt = Arc::new(AtomicBool::new(false));
    let executor = InterruptAfterAnat {
        inner: Scripted::default(),
        interrupt: interrupt.clone(),
    };
    let summary = petdeface::run_with_interrupt(&config, &executor, interrupt).unwrap();
    let report = &summary.report;

    assert_eq!(executor.inner.ran(), vec!["anat-deface:sub-01_T1w".to_string()]);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.skipped(), 2);
    assert_eq!(summary.exit_code(), 1);
    assert!(study.defaced().join("sub-01/anat/sub-01_T1w.nii.gz").is_file());
}
