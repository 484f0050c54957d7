//! The closed set of tasks the pipeline knows how to run.
//!
//! Every task carries a typed parameter record with fully resolved paths, so
//! the scheduler never has to consult the placement policy again and the
//! tool adapter can dispatch exhaustively on the kind.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::TemplateAnat;
use crate::dataset::Acquisition;

/// Parameters of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Deface an anatomical image and keep its face mask.
    AnatDeface {
        anat: Utf8PathBuf,
        defaced: Utf8PathBuf,
        facemask: Utf8PathBuf,
    },
    /// Build a synthetic anatomical for a PET image from a template, or
    /// from the PET frames themselves, and compute its face mask.
    TemplateSubstitute {
        template: TemplateAnat,
        /// Template image, or the PET image for [`TemplateAnat::Pet`].
        source: Utf8PathBuf,
        anat: Utf8PathBuf,
        facemask: Utf8PathBuf,
    },
    /// Average the frames of a PET image and register the average onto its
    /// (possibly synthetic) anatomical.
    Register {
        moving: Utf8PathBuf,
        average: Utf8PathBuf,
        reference: Utf8PathBuf,
        transform: Utf8PathBuf,
    },
    /// Apply an anatomical face mask to a PET image through a transform.
    ModalityDeface {
        image: Utf8PathBuf,
        facemask: Utf8PathBuf,
        transform: Utf8PathBuf,
        defaced: Utf8PathBuf,
        /// Provenance of the defaced image, in the derivatives tree. Marks the
        /// task as done even when `defaced` overwrote `image`.
        record: Utf8PathBuf,
    },
    /// Render before/after pictures of a defaced anatomical. There is no
    /// "before" once the original has been overwritten.
    Preview {
        original: Option<Utf8PathBuf>,
        defaced: Utf8PathBuf,
        before: Option<Utf8PathBuf>,
        after: Utf8PathBuf,
    },
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AnatDeface { .. } => "anat-deface",
            TaskKind::TemplateSubstitute { .. } => "template-substitute",
            TaskKind::Register { .. } => "register",
            TaskKind::ModalityDeface { .. } => "modality-deface",
            TaskKind::Preview { .. } => "preview",
        }
    }

    pub fn inputs(&self) -> Vec<&Utf8Path> {
        match self {
            TaskKind::AnatDeface { anat, .. } => vec![anat.as_path()],
            TaskKind::TemplateSubstitute { source, .. } => vec![source.as_path()],
            TaskKind::Register {
                moving, reference, ..
            } => vec![moving.as_path(), reference.as_path()],
            TaskKind::ModalityDeface {
                image,
                facemask,
                transform,
                ..
            } => vec![image.as_path(), facemask.as_path(), transform.as_path()],
            TaskKind::Preview {
                original, defaced, ..
            } => original.iter().chain([defaced]).map(|p| p.as_path()).collect(),
        }
    }

    pub fn outputs(&self) -> Vec<&Utf8Path> {
        match self {
            TaskKind::AnatDeface {
                defaced, facemask, ..
            } => vec![defaced.as_path(), facemask.as_path()],
            TaskKind::TemplateSubstitute { anat, facemask, .. } => {
                vec![anat.as_path(), facemask.as_path()]
            }
            TaskKind::Register {
                average, transform, ..
            } => vec![average.as_path(), transform.as_path()],
            TaskKind::ModalityDeface {
                defaced, record, ..
            } => vec![defaced.as_path(), record.as_path()],
            TaskKind::Preview { before, after, .. } => {
                before.iter().chain([after]).map(|p| p.as_path()).collect()
            }
        }
    }
}

/// A node of the task graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub subject: String,
    pub session: Option<String>,
    /// Name of the acquisition the task derives from, without extension.
    pub label: String,
}

impl Task {
    pub fn new(acquisition: &Acquisition, kind: TaskKind) -> Self {
        let file = acquisition.file_name();
        let label = if file.entities.is_empty() {
            file.suffix.to_string()
        } else {
            format!("{}_{}", file.entities, file.suffix)
        };

        Self {
            kind,
            subject: acquisition.subject.clone(),
            session: acquisition.session.clone(),
            label,
        }
    }

    /// Unique within a graph, e.g. `register:sub-01_ses-a_pet`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.label)
    }

    pub fn inputs(&self) -> Vec<&Utf8Path> {
        self.kind.inputs()
    }

    pub fn outputs(&self) -> Vec<&Utf8Path> {
        self.kind.outputs()
    }

    /// Outputs that are not also inputs. An image defaced in place already
    /// exists before the task runs, so it says nothing about the task's
    /// progress and must never be removed up front.
    pub fn produced(&self) -> Vec<&Utf8Path> {
        let inputs = self.inputs();
        self.outputs()
            .into_iter()
            .filter(|output| !inputs.contains(output))
            .collect()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.subject)?;
        if let Some(session) = &self.session {
            write!(f, " ses-{session}")?;
        }
        write!(f, " {} ({})", self.kind.as_str(), self.label)
    }
}
