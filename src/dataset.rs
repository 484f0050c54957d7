//! Discovery of subjects, sessions and acquisitions in a BIDS dataset.
//!
//! The scan is read-only. It produces a [`DatasetIndex`] that the selector
//! and the blueprint consume; nothing mutates it afterwards.

use std::collections::{BTreeMap, HashSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{Pattern, glob};
use serde::Deserialize;

use crate::error::DatasetScanError;

/// File required at the root of every dataset.
pub const DESCRIPTOR: &str = "dataset_description.json";

/// Whether an acquisition is a registration reference or needs to be
/// registered onto one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionKind {
    /// Structural T1w scan.
    Anatomical,
    /// PET scan, aligned to an anatomical image before defacing.
    Paired,
}

impl AcquisitionKind {
    fn classify(datatype: &str, suffix: &str) -> Option<Self> {
        match (datatype, suffix) {
            ("anat", "T1w") => Some(AcquisitionKind::Anatomical),
            ("pet", "pet") => Some(AcquisitionKind::Paired),
            _ => None,
        }
    }
}

/// A BIDS file name split into its parts.
///
/// `sub-01_ses-a_T1w.nii.gz` has the entities `sub-01_ses-a`, the suffix
/// `T1w` and the extension `.nii.gz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileName<'a> {
    pub entities: &'a str,
    pub suffix: &'a str,
    pub extension: &'a str,
}

impl<'a> FileName<'a> {
    pub fn parse(name: &'a str) -> Self {
        let (stem, extension) = match name.find('.') {
            Some(dot) => name.split_at(dot),
            None => (name, ""),
        };

        let (entities, suffix) = match stem.rfind('_') {
            Some(underscore) => (&stem[..underscore], &stem[underscore + 1..]),
            None => ("", stem),
        };

        Self {
            entities,
            suffix,
            extension,
        }
    }

    /// Reassembles the name with an extra `desc-<label>` entity and,
    /// optionally, a different suffix or extension.
    pub fn with_desc(&self, label: &str, suffix: Option<&str>, extension: Option<&str>) -> String {
        let suffix = suffix.unwrap_or(self.suffix);
        let extension = extension.unwrap_or(self.extension);

        if self.entities.is_empty() {
            format!("desc-{label}_{suffix}{extension}")
        } else {
            format!("{}_desc-{label}_{suffix}{extension}", self.entities)
        }
    }
}

/// A single image with its metadata sidecars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    /// Absolute path to the primary image.
    pub image: Utf8PathBuf,
    /// Path of the image relative to the dataset root.
    pub relative: Utf8PathBuf,
    pub sidecars: Vec<Utf8PathBuf>,
    pub kind: AcquisitionKind,
    /// BIDS datatype folder holding the image (`anat`, `pet`).
    pub datatype: String,
    pub subject: String,
    pub session: Option<String>,
}

impl Acquisition {
    pub fn file_name(&self) -> FileName<'_> {
        FileName::parse(self.relative.file_name().unwrap_or_default())
    }

    /// Directory of the image relative to the dataset root.
    pub fn relative_dir(&self) -> &Utf8Path {
        self.relative.parent().unwrap_or(Utf8Path::new(""))
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub acquisitions: Vec<Acquisition>,
}

#[derive(Debug, Clone)]
pub struct Subject {
    pub id: String,
    /// Acquisitions stored directly under the subject folder.
    pub acquisitions: Vec<Acquisition>,
    pub sessions: Vec<Session>,
}

impl Subject {
    pub fn all_acquisitions(&self) -> impl Iterator<Item = &Acquisition> {
        self.acquisitions
            .iter()
            .chain(self.sessions.iter().flat_map(|s| s.acquisitions.iter()))
    }

    pub fn anatomicals(&self) -> impl Iterator<Item = &Acquisition> {
        self.all_acquisitions()
            .filter(|a| a.kind == AcquisitionKind::Anatomical)
    }

    pub fn paired(&self) -> impl Iterator<Item = &Acquisition> {
        self.all_acquisitions()
            .filter(|a| a.kind == AcquisitionKind::Paired)
    }

    pub fn has_anatomical(&self) -> bool {
        self.anatomicals().next().is_some()
    }

    /// Subject has PET data but nothing to register it onto.
    pub fn needs_template(&self) -> bool {
        !self.has_anatomical() && self.paired().next().is_some()
    }

    /// The anatomical image to register `paired` onto: the one whose path
    /// shares the longest common prefix with it. Ties go to the first image
    /// in path order.
    pub fn best_anatomical(&self, paired: &Acquisition) -> Option<&Acquisition> {
        let target = paired.relative.as_str();
        let mut best: Option<(&Acquisition, usize)> = None;

        for anat in self.anatomicals() {
            let score = common_prefix(target, anat.relative.as_str());
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((anat, score));
            }
        }

        best.map(|(anat, _)| anat)
    }
}

/// Number of matching characters up to the first discrepancy.
fn common_prefix(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Contents of `dataset_description.json` that the pipeline cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "BIDSVersion", default)]
    pub bids_version: Option<String>,
}

/// Catalog of everything found in the input dataset.
#[derive(Debug, Clone)]
pub struct DatasetIndex {
    pub root: Utf8PathBuf,
    pub descriptor: Descriptor,
    pub subjects: Vec<Subject>,
}

impl DatasetIndex {
    /// Scans `root` and classifies every image it finds.
    pub fn build(root: impl AsRef<Utf8Path>) -> Result<Self, DatasetScanError> {
        let root = root.as_ref();

        if !root.is_dir() {
            return Err(DatasetScanError::NotADirectory(root.to_path_buf()));
        }

        let descriptor = read_descriptor(root)?;

        let escaped = Pattern::escape(root.as_str());
        let mut subjects = Vec::new();

        for path in glob(&format!("{escaped}/sub-*"))? {
            let path = Utf8PathBuf::try_from(path?)?;
            if !path.is_dir() {
                continue;
            }

            subjects.push(scan_subject(root, &path)?);
        }

        if subjects.is_empty() {
            return Err(DatasetScanError::NoSubjects(root.to_path_buf()));
        }

        tracing::debug!(
            "indexed {} subjects, {} acquisitions",
            subjects.len(),
            subjects
                .iter()
                .map(|s| s.all_acquisitions().count())
                .sum::<usize>()
        );

        Ok(Self {
            root: root.to_path_buf(),
            descriptor,
            subjects,
        })
    }

    pub fn subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    /// Absolute paths of every indexed primary image.
    pub fn images(&self) -> HashSet<&Utf8Path> {
        self.subjects
            .iter()
            .flat_map(Subject::all_acquisitions)
            .map(|a| a.image.as_path())
            .collect()
    }
}

fn read_descriptor(root: &Utf8Path) -> Result<Descriptor, DatasetScanError> {
    let path = root.join(DESCRIPTOR);

    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DatasetScanError::MissingDescriptor(path));
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&text).map_err(|source| DatasetScanError::Descriptor { path, source })
}

fn scan_subject(root: &Utf8Path, dir: &Utf8Path) -> Result<Subject, DatasetScanError> {
    let id = dir
        .file_name()
        .and_then(|name| name.strip_prefix("sub-"))
        .unwrap_or_default()
        .to_string();

    let escaped = Pattern::escape(dir.as_str());
    let mut sessions = BTreeMap::new();

    for path in glob(&format!("{escaped}/ses-*"))? {
        let path = Utf8PathBuf::try_from(path?)?;
        if let Some(ses) = path.file_name().and_then(|n| n.strip_prefix("ses-")) {
            if path.is_dir() {
                sessions.insert(ses.to_string(), Vec::new());
            }
        }
    }

    let mut acquisitions = Vec::new();

    for pattern in [
        format!("{escaped}/*/*.nii*"),
        format!("{escaped}/ses-*/*/*.nii*"),
    ] {
        for path in glob(&pattern)? {
            let path = Utf8PathBuf::try_from(path?)?;
            let Some(acquisition) = classify(root, &id, &path) else {
                continue;
            };

            match &acquisition.session {
                Some(ses) => sessions.entry(ses.clone()).or_default().push(acquisition),
                None => acquisitions.push(acquisition),
            }
        }
    }

    Ok(Subject {
        id,
        acquisitions,
        sessions: sessions
            .into_iter()
            .map(|(id, acquisitions)| Session { id, acquisitions })
            .collect(),
    })
}

fn classify(root: &Utf8Path, subject: &str, path: &Utf8Path) -> Option<Acquisition> {
    let name = path.file_name()?;
    if !(name.ends_with(".nii") || name.ends_with(".nii.gz")) {
        return None;
    }

    let relative = path.strip_prefix(root).ok()?.to_path_buf();
    let datatype = path.parent()?.file_name()?;
    let session = path
        .parent()?
        .parent()?
        .file_name()?
        .strip_prefix("ses-")
        .map(str::to_string);

    let file = FileName::parse(name);
    let Some(kind) = AcquisitionKind::classify(datatype, file.suffix) else {
        tracing::debug!("ignoring {relative}");
        return None;
    };

    let sidecar = path.with_file_name(format!("{}_{}.json", file.entities, file.suffix));
    let sidecars = if sidecar.is_file() {
        vec![sidecar]
    } else {
        vec![]
    };

    Some(Acquisition {
        image: path.to_path_buf(),
        relative,
        sidecars,
        kind,
        datatype: datatype.to_string(),
        subject: subject.to_string(),
        session,
    })
}
