//! petdeface CLI entry point.
//!
//! Parses the command line into a [`Config`], initializes logging and either
//! runs the pipeline locally or hands it to a container runtime.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use petdeface::container::{self, Runtime};
use petdeface::{Config, PipelineError, PlacementMode, Selection, SetupError, TemplateAnat, Toolchain};

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
enum AnalysisLevel {
    #[default]
    Participant,
}

/// Deface the anatomical and PET images of a BIDS dataset.
#[derive(Parser, Debug)]
#[command(name = "petdeface", version, about)]
struct Args {
    /// Root of the input BIDS dataset.
    input_dir: Utf8PathBuf,

    /// Output root; defaults depend on --placement.
    #[arg(long = "output_dir")]
    output_dir: Option<Utf8PathBuf>,

    #[arg(long = "analysis_level", value_enum, default_value_t = AnalysisLevel::Participant)]
    analysis_level: AnalysisLevel,

    /// Only deface anatomical images.
    #[arg(long = "anat_only")]
    anat_only: bool,

    #[arg(long = "participant_label", num_args = 1..)]
    participant_label: Vec<String>,

    #[arg(long = "participant_label_exclude", num_args = 1..)]
    participant_label_exclude: Vec<String>,

    #[arg(long = "session_label", num_args = 1..)]
    session_label: Vec<String>,

    #[arg(long = "session_label_exclude", num_args = 1..)]
    session_label_exclude: Vec<String>,

    /// Number of tasks run at once.
    #[arg(long = "n_procs", default_value_t = 2)]
    n_procs: usize,

    #[arg(long = "skip_bids_validator")]
    skip_bids_validator: bool,

    #[arg(long, value_enum, default_value_t = PlacementMode::Adjacent)]
    placement: PlacementMode,

    /// Delete existing outputs instead of skipping up to date tasks.
    #[arg(long = "remove_existing")]
    remove_existing: bool,

    /// Render before/after previews of every defaced anatomical image.
    #[arg(long = "preview_pics")]
    preview_pics: bool,

    /// Anatomical stand-in for subjects without a T1w image.
    #[arg(long = "use_template_anat", value_enum)]
    use_template_anat: Option<TemplateAnat>,

    /// Image used by `--use_template_anat t1`.
    #[arg(long = "template_t1")]
    template_t1: Option<Utf8PathBuf>,

    /// Open the QA page when the run is done.
    #[arg(long = "open_browser")]
    open_browser: bool,

    /// Run inside the Docker image instead of the local toolchain.
    #[arg(long, conflicts_with = "singularity")]
    docker: bool,

    /// Run inside the image with Singularity.
    #[arg(long)]
    singularity: bool,

    #[arg(long = "freesurfer_home", env = "FREESURFER_HOME")]
    freesurfer_home: Option<Utf8PathBuf>,

    #[arg(long = "fs_license", env = "FS_LICENSE")]
    fs_license: Option<Utf8PathBuf>,

    /// Ignored when RUST_LOG is set.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn absolute(path: &Utf8PathBuf) -> anyhow::Result<Utf8PathBuf> {
    let path = std::path::absolute(path).with_context(|| format!("Couldn't resolve '{path}'"))?;
    Utf8PathBuf::try_from(path).context("Couldn't convert path to UTF-8")
}

impl Args {
    fn runtime(&self) -> Option<Runtime> {
        match (self.docker, self.singularity) {
            (true, _) => Some(Runtime::Docker),
            (_, true) => Some(Runtime::Singularity),
            _ => None,
        }
    }

    fn config(self) -> anyhow::Result<Config> {
        let AnalysisLevel::Participant = self.analysis_level;

        let mut config = Config::new(absolute(&self.input_dir)?);
        config.output_dir = self.output_dir.as_ref().map(absolute).transpose()?;
        config.placement = self.placement;
        config.remove_existing = self.remove_existing;
        config.anat_only = self.anat_only;
        config.preview = self.preview_pics;
        config.template = self.use_template_anat;
        config.n_procs = self.n_procs;
        config.skip_validator = self.skip_bids_validator;
        config.open_browser = self.open_browser;
        config.selection = Selection {
            include_subjects: self.participant_label,
            exclude_subjects: self.participant_label_exclude,
            include_sessions: self.session_label,
            exclude_sessions: self.session_label_exclude,
        };
        config.toolchain = Toolchain {
            freesurfer_home: self.freesurfer_home,
            license: self.fs_license,
            template_t1: self.template_t1.as_ref().map(absolute).transpose()?,
            ..Toolchain::default()
        };

        Ok(config)
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Couldn't listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("Couldn't listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Raises `interrupt` on the first signal so the scheduler stops dispatching.
/// A second signal exits right away.
fn watch_signals(interrupt: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("petdeface-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::warn!("Couldn't start the signal handler: {err}");
                    return;
                }
            };

            runtime.block_on(async {
                loop {
                    shutdown_signal().await;
                    if interrupt.swap(true, Ordering::SeqCst) {
                        tracing::error!("Interrupted twice, exiting without waiting");
                        std::process::exit(130);
                    }
                    tracing::warn!("Interrupted, letting running tasks finish. Interrupt again to exit now");
                }
            });
        });

    if let Err(err) = spawned {
        tracing::warn!("Couldn't start the signal handler: {err}");
    }
}

fn execute(args: Args) -> anyhow::Result<u8> {
    let runtime = args.runtime();
    let config = args.config()?;

    if let Some(runtime) = runtime {
        let command = container::container_command(runtime, &config);
        let status = container::run_container(&command)?;
        return Ok(status.code().and_then(|code| u8::try_from(code).ok()).unwrap_or(1));
    }

    petdeface::preflight(&config).map_err(PipelineError::Setup)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    watch_signals(interrupt.clone());

    let summary = petdeface::run_with_interrupt(&config, &config.toolchain, interrupt)?;
    if !summary.report.failures.is_empty() {
        tracing::warn!(
            "{} tasks failed or were skipped, see {}",
            summary.report.failures.len(),
            summary.graph_file
        );
    }
    if !summary.report.unprocessable.is_empty() {
        tracing::warn!(
            "no anatomical image or template for sub-{}",
            summary.report.unprocessable.join(", sub-")
        );
    }

    Ok(summary.exit_code())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<PipelineError>() {
        err.exit_code()
    } else if err.downcast_ref::<SetupError>().is_some() {
        3
    } else {
        1
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = petdeface::init_logging(&args.log_level) {
        eprintln!("Couldn't initialize logging: {err}");
    }

    match execute(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
