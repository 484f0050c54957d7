use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while scanning the input dataset. Always fatal to the run.
#[derive(Debug, Error)]
pub enum DatasetScanError {
    #[error("Input directory '{0}' does not exist or is not a directory")]
    NotADirectory(Utf8PathBuf),

    #[error("Dataset descriptor '{0}' is missing")]
    MissingDescriptor(Utf8PathBuf),

    #[error("Dataset descriptor '{path}' is malformed:\n{source}")]
    Descriptor {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("No subject directories (sub-*) found under '{0}'")]
    NoSubjects(Utf8PathBuf),

    #[error("Couldn't read dataset.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// The filters left nothing to process. Fatal before the graph is built.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("No subjects left to process after applying filters (include: [{include}], exclude: [{exclude}])")]
    Empty { include: String, exclude: String },
}

/// An output location could not be materialized. Fails only the owning task.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("Couldn't create output directory '{path}': {source}")]
    CreateDir {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't remove existing output '{path}': {source}")]
    RemoveExisting {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Output path '{0}' has no parent directory")]
    NoParent(Utf8PathBuf),
}

/// An external tool failed. Fails only the owning task.
#[derive(Debug, Error)]
pub enum ToolInvocationError {
    #[error("Couldn't start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}\n{stderr}")]
    ExitStatus {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Expected output '{0}' was not produced")]
    MissingOutput(Utf8PathBuf),

    #[error("Couldn't move staged output into '{path}': {source}")]
    Stage {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Task panicked: {0}")]
    Panic(String),
}

/// The scheduler dispatched more tasks than exist or stalled with unfinished
/// tasks. Unreachable for graphs produced by the blueprint.
#[derive(Debug, Error)]
#[error("Cycle detected in task graph: {dispatched} dispatches, {finished} of {total} tasks finished")]
pub struct GraphCycleError {
    pub dispatched: usize,
    pub finished: usize,
    pub total: usize,
}

/// Preconditions checked before any task is dispatched.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("FreeSurfer license not found (set FS_LICENSE or FREESURFER_HOME)")]
    License,

    #[error("FreeSurfer license '{0}' does not exist")]
    LicenseMissing(Utf8PathBuf),

    #[error("Dataset validation failed:\n{0}")]
    Validator(ToolInvocationError),

    #[error("Template anatomical '{0}' does not exist")]
    Template(Utf8PathBuf),

    #[error("Template anatomical 't1' requires --template_t1")]
    TemplateUnset,

    #[error("Couldn't build worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Top level error for a whole pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Error while scanning the dataset:\n{0}")]
    Scan(#[from] DatasetScanError),

    #[error("Error while selecting subjects:\n{0}")]
    Selection(#[from] SelectionError),

    #[error("Error while preparing the run:\n{0}")]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Cycle(#[from] GraphCycleError),

    #[error("Error while writing outputs:\n{0}")]
    Output(#[from] std::io::Error),
}

impl PipelineError {
    /// Process exit status for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Scan(_) | PipelineError::Selection(_) => 2,
            PipelineError::Setup(_) => 3,
            PipelineError::Cycle(_) | PipelineError::Output(_) => 1,
        }
    }
}
