//! Where pipeline outputs are written.
//!
//! A [`Placement`] is derived once from the configuration. It hands out a
//! [`PlacementPlan`] per subject, which maps a logical artifact (a defaced
//! image, a face mask, a transform, ...) to a concrete path. Resolution is
//! pure; touching the filesystem is left to [`prepare`], which the scheduler
//! calls right before a task is dispatched.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{Config, PIPELINE, PlacementMode, TemplateAnat};
use crate::dataset::{Acquisition, Subject};
use crate::error::PlacementError;

/// Which of the two preview renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Before,
    After,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Before => "before",
            Stage::After => "after",
        }
    }
}

/// A logical output of some task, tied to the acquisition it derives from.
#[derive(Debug, Clone, Copy)]
pub enum Artifact<'a> {
    /// The defaced primary image.
    Defaced(&'a Acquisition),
    /// Face mask computed from an anatomical image.
    FaceMask(&'a Acquisition),
    /// Registration of a paired acquisition onto its anatomical image.
    Transform(&'a Acquisition),
    /// Frame average of a dynamic acquisition, the moving image of the
    /// registration.
    Average(&'a Acquisition),
    /// JSON provenance of a defaced paired acquisition.
    Record(&'a Acquisition),
    Preview(&'a Acquisition, Stage),
    /// Synthetic anatomical standing in for a missing T1w, per PET image.
    Template(&'a Acquisition, TemplateAnat),
    /// Face mask of a synthetic anatomical.
    TemplateMask(&'a Acquisition, TemplateAnat),
}

/// Output roots for a run.
#[derive(Debug, Clone)]
pub struct Placement {
    mode: PlacementMode,
    primary_root: Utf8PathBuf,
    derivatives_root: Utf8PathBuf,
}

impl Placement {
    pub fn new(config: &Config) -> Self {
        let input = config.input_dir();

        match config.placement {
            PlacementMode::Adjacent => {
                let primary = config
                    .output_dir
                    .clone()
                    .unwrap_or_else(|| sibling(input));
                Self {
                    mode: config.placement,
                    derivatives_root: primary.join("derivatives").join(PIPELINE),
                    primary_root: primary,
                }
            }
            PlacementMode::Inplace => {
                if config.output_dir.is_some() {
                    tracing::warn!("--output_dir is ignored with in-place placement");
                }
                Self {
                    mode: config.placement,
                    primary_root: input.to_path_buf(),
                    derivatives_root: input.join("derivatives").join(PIPELINE),
                }
            }
            PlacementMode::Derivatives => {
                let derivatives = config
                    .output_dir
                    .clone()
                    .unwrap_or_else(|| input.join("derivatives").join(PIPELINE));
                Self {
                    mode: config.placement,
                    primary_root: derivatives.clone(),
                    derivatives_root: derivatives,
                }
            }
        }
    }

    pub fn mode(&self) -> PlacementMode {
        self.mode
    }

    /// Root that mirrors the input layout with defaced images.
    pub fn primary_root(&self) -> &Utf8Path {
        &self.primary_root
    }

    /// Root of the auxiliary outputs.
    pub fn derivatives_root(&self) -> &Utf8Path {
        &self.derivatives_root
    }

    pub fn plan(&self, subject: &Subject) -> PlacementPlan {
        PlacementPlan {
            subject: subject.id.clone(),
            mode: self.mode,
            primary_root: self.primary_root.clone(),
            derivatives_root: self.derivatives_root.clone(),
        }
    }
}

/// `/data/study` -> `/data/study_defaced`
fn sibling(input: &Utf8Path) -> Utf8PathBuf {
    match (input.parent(), input.file_name()) {
        (Some(parent), Some(name)) => parent.join(format!("{name}_defaced")),
        _ => input.join("defaced"),
    }
}

/// Resolved output locations for one subject.
#[derive(Debug, Clone)]
pub struct PlacementPlan {
    subject: String,
    mode: PlacementMode,
    primary_root: Utf8PathBuf,
    derivatives_root: Utf8PathBuf,
}

impl PlacementPlan {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn derivatives_root(&self) -> &Utf8Path {
        &self.derivatives_root
    }

    pub fn resolve(&self, artifact: Artifact<'_>) -> Utf8PathBuf {
        debug_assert!(match artifact {
            Artifact::Defaced(a)
            | Artifact::FaceMask(a)
            | Artifact::Transform(a)
            | Artifact::Average(a)
            | Artifact::Record(a)
            | Artifact::Preview(a, _)
            | Artifact::Template(a, _)
            | Artifact::TemplateMask(a, _) => a.subject == self.subject,
        });

        match artifact {
            Artifact::Defaced(acq) => match self.mode {
                PlacementMode::Adjacent | PlacementMode::Inplace => {
                    self.primary_root.join(&acq.relative)
                }
                PlacementMode::Derivatives => self.auxiliary(acq, "defaced", None, None),
            },
            Artifact::FaceMask(acq) => self.auxiliary(acq, "defacemask", None, None),
            Artifact::Transform(acq) => {
                let label = format!("{}2anat", acq.datatype);
                self.auxiliary(acq, &label, None, Some(".lta"))
            }
            Artifact::Average(acq) => self.auxiliary(acq, "wavg", None, None),
            Artifact::Record(acq) => self.auxiliary(acq, "defaced", None, Some(".json")),
            Artifact::Preview(acq, stage) => {
                self.auxiliary(acq, stage.as_str(), None, Some(".png"))
            }
            Artifact::Template(acq, kind) => {
                let label = format!("{}template", kind.as_str());
                self.synthetic(acq, &label)
            }
            Artifact::TemplateMask(acq, kind) => {
                let label = format!("{}templatemask", kind.as_str());
                self.synthetic(acq, &label)
            }
        }
    }

    fn auxiliary(
        &self,
        acq: &Acquisition,
        desc: &str,
        suffix: Option<&str>,
        extension: Option<&str>,
    ) -> Utf8PathBuf {
        self.derivatives_root
            .join(acq.relative_dir())
            .join(acq.file_name().with_desc(desc, suffix, extension))
    }

    /// Synthetic anatomicals live in the `anat` folder next to the PET folder.
    fn synthetic(&self, acq: &Acquisition, desc: &str) -> Utf8PathBuf {
        let dir = acq
            .relative_dir()
            .parent()
            .unwrap_or(Utf8Path::new(""))
            .join("anat");

        self.derivatives_root
            .join(dir)
            .join(acq.file_name().with_desc(desc, Some("T1w"), Some(".nii.gz")))
    }
}

/// State of an output location right before its task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepared {
    /// Nothing there, the task has to produce it.
    Fresh,
    /// A previous run already produced it.
    Existing,
}

/// Creates the parent directory of `path` and deals with a previous output.
pub fn prepare(path: &Utf8Path, remove_existing: bool) -> Result<Prepared, PlacementError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .ok_or_else(|| PlacementError::NoParent(path.to_path_buf()))?;

    fs::create_dir_all(parent).map_err(|source| PlacementError::CreateDir {
        path: parent.to_path_buf(),
        source,
    })?;

    if fs::symlink_metadata(path).is_err() {
        return Ok(Prepared::Fresh);
    }

    if remove_existing {
        fs::remove_file(path).map_err(|source| PlacementError::RemoveExisting {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("removed existing output {path}");
        Ok(Prepared::Fresh)
    } else {
        Ok(Prepared::Existing)
    }
}
