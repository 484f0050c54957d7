//! Subject and session filtering.
//!
//! An include list, when non-empty, restricts the candidates first. Exclude
//! lists are subtracted afterwards, so a label present in both is excluded.

use std::collections::HashSet;

use camino::Utf8PathBuf;

use crate::core::Selection;
use crate::dataset::{DatasetIndex, Subject};
use crate::error::SelectionError;

/// The reduced set of subjects (and their sessions) to process.
#[derive(Debug, Clone)]
pub struct WorkSet {
    pub root: Utf8PathBuf,
    pub subjects: Vec<Subject>,
}

impl WorkSet {
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

fn labels<'a>(raw: &'a [String], prefix: &str) -> HashSet<&'a str> {
    raw.iter()
        .map(|label| label.trim())
        .map(|label| label.strip_prefix(prefix).unwrap_or(label))
        .filter(|label| !label.is_empty())
        .collect()
}

/// `include` (or everything when empty) minus `exclude`.
fn admits(include: &HashSet<&str>, exclude: &HashSet<&str>, label: &str) -> bool {
    (include.is_empty() || include.contains(label)) && !exclude.contains(label)
}

/// Applies the subject and session filters to the index.
///
/// Session filters apply to session folders only. Subject-level acquisitions
/// are kept whenever their subject is, but a subject that has sessions and
/// loses all of them is dropped, as is a session-less subject when an
/// explicit session include list is given.
pub fn select(index: &DatasetIndex, selection: &Selection) -> Result<WorkSet, SelectionError> {
    let sub_include = labels(&selection.include_subjects, "sub-");
    let sub_exclude = labels(&selection.exclude_subjects, "sub-");
    let ses_include = labels(&selection.include_sessions, "ses-");
    let ses_exclude = labels(&selection.exclude_sessions, "ses-");

    for label in &sub_include {
        if index.subject(label).is_none() {
            tracing::warn!("subject sub-{label} requested but not found in dataset");
        }
    }

    let filter_sessions = !ses_include.is_empty() || !ses_exclude.is_empty();

    let subjects: Vec<Subject> = index
        .subjects
        .iter()
        .filter(|subject| admits(&sub_include, &sub_exclude, &subject.id))
        .filter_map(|subject| {
            if !filter_sessions {
                return Some(subject.clone());
            }

            if subject.sessions.is_empty() {
                return ses_include.is_empty().then(|| subject.clone());
            }

            let sessions: Vec<_> = subject
                .sessions
                .iter()
                .filter(|session| admits(&ses_include, &ses_exclude, &session.id))
                .cloned()
                .collect();

            if sessions.is_empty() {
                tracing::debug!("subject sub-{} has no selected sessions", subject.id);
                return None;
            }

            Some(Subject {
                id: subject.id.clone(),
                acquisitions: subject.acquisitions.clone(),
                sessions,
            })
        })
        .collect();

    if subjects.is_empty() {
        return Err(SelectionError::Empty {
            include: selection.include_subjects.join(", "),
            exclude: selection.exclude_subjects.join(", "),
        });
    }

    tracing::info!(
        "selected {} of {} subjects",
        subjects.len(),
        index.subjects.len()
    );

    Ok(WorkSet {
        root: index.root.clone(),
        subjects,
    })
}
