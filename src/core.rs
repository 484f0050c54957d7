//! Run configuration shared by every stage of the pipeline.
//!
//! A [`Config`] is assembled once (usually from the command line) and then
//! passed by reference to the dataset scan, the blueprint and the scheduler.
//! Nothing downstream reads the process environment; tool discovery happens
//! while the configuration is built.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::SetupError;

/// Name of the pipeline, used for the derivatives folder and descriptors.
pub const PIPELINE: &str = "petdeface";

/// BIDS version written into generated dataset descriptors.
pub const BIDS_VERSION: &str = "1.8.0";

/// Policy governing where outputs are written relative to the input dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PlacementMode {
    /// Write a defaced copy next to the input, in `<input>_defaced`.
    #[default]
    Adjacent,
    /// Overwrite the original images; auxiliary files go to derivatives.
    Inplace,
    /// Write everything into `derivatives/petdeface`, inputs untouched.
    Derivatives,
}

/// Synthetic anatomical image used for subjects without a T1w scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum TemplateAnat {
    /// T1w template bundled with the pipeline.
    T1,
    /// MNI305 average brain shipped with FreeSurfer.
    Mni,
    /// Time-averaged PET image of the subject itself.
    Pet,
}

impl TemplateAnat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateAnat::T1 => "t1",
            TemplateAnat::Mni => "mni",
            TemplateAnat::Pet => "pet",
        }
    }
}

/// Names and locations of the external programs the pipeline drives.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub mideface: String,
    pub mri_coreg: String,
    pub mri_concat: String,
    pub mri_convert: String,
    pub slicer: String,
    pub validator: String,
    pub freesurfer_home: Option<Utf8PathBuf>,
    pub license: Option<Utf8PathBuf>,
    pub template_t1: Option<Utf8PathBuf>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            mideface: "mideface".into(),
            mri_coreg: "mri_coreg".into(),
            mri_concat: "mri_concat".into(),
            mri_convert: "mri_convert".into(),
            slicer: "slicer".into(),
            validator: "bids-validator".into(),
            freesurfer_home: None,
            license: None,
            template_t1: None,
        }
    }
}

impl Toolchain {
    /// Location of the FreeSurfer license, preferring an explicit path over
    /// the one inside the FreeSurfer installation.
    pub fn license_path(&self) -> Result<Utf8PathBuf, SetupError> {
        let path = match (&self.license, &self.freesurfer_home) {
            (Some(license), _) => license.clone(),
            (None, Some(home)) => home.join("license.txt"),
            (None, None) => return Err(SetupError::License),
        };

        if path.is_file() {
            Ok(path)
        } else {
            Err(SetupError::LicenseMissing(path))
        }
    }

    /// Image copied in as the synthetic anatomical for `template`, or `None`
    /// when the template is derived from the subject's own PET data.
    pub fn template_path(&self, template: TemplateAnat) -> Result<Option<Utf8PathBuf>, SetupError> {
        let path = match template {
            TemplateAnat::Pet => return Ok(None),
            TemplateAnat::T1 => self.template_t1.clone().ok_or(SetupError::TemplateUnset)?,
            TemplateAnat::Mni => self
                .freesurfer_home
                .as_ref()
                .map(|home| home.join("average").join("mni305.cor.mgz"))
                .ok_or(SetupError::License)?,
        };

        if path.is_file() {
            Ok(Some(path))
        } else {
            Err(SetupError::Template(path))
        }
    }
}

/// Subject and session filters. Labels may carry the `sub-`/`ses-` prefix.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub include_subjects: Vec<String>,
    pub exclude_subjects: Vec<String>,
    pub include_sessions: Vec<String>,
    pub exclude_sessions: Vec<String>,
}

/// Immutable configuration for a single pipeline run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the input BIDS dataset.
    pub input_dir: Utf8PathBuf,
    /// Overrides the default output root of the selected placement mode.
    pub output_dir: Option<Utf8PathBuf>,
    pub placement: PlacementMode,
    /// Delete pre-existing outputs instead of skipping their tasks.
    pub remove_existing: bool,
    /// Only deface anatomical images.
    pub anat_only: bool,
    /// Render before/after previews of every defaced anatomical image.
    pub preview: bool,
    pub template: Option<TemplateAnat>,
    /// Number of worker threads, at least one.
    pub n_procs: usize,
    pub skip_validator: bool,
    pub open_browser: bool,
    pub selection: Selection,
    pub toolchain: Toolchain,
}

impl Config {
    /// Configuration with defaults for everything but the input directory.
    pub fn new(input_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: None,
            placement: PlacementMode::default(),
            remove_existing: false,
            anat_only: false,
            preview: false,
            template: None,
            n_procs: 2,
            skip_validator: false,
            open_browser: false,
            selection: Selection::default(),
            toolchain: Toolchain::default(),
        }
    }

    pub fn input_dir(&self) -> &Utf8Path {
        &self.input_dir
    }

    pub fn workers(&self) -> usize {
        self.n_procs.max(1)
    }
}
