//! Fixtures shared by the unit and integration tests, compiled for the
//! latter through the `testing` feature.

use std::collections::HashSet;
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::error::ToolInvocationError;
use crate::task::Task;
use crate::tool::Executor;

/// A throwaway BIDS dataset on disk.
pub struct Fixture {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    /// Dataset with a descriptor and no subjects.
    pub fn new() -> Self {
        let fixture = Self::bare();
        fixture.write(
            "dataset_description.json",
            r#"{"Name": "fixture", "BIDSVersion": "1.8.0"}"#,
        );
        fixture
    }

    /// Directory next to the dataset, for files that must not be indexed.
    pub fn scratch(&self) -> Utf8PathBuf {
        let path = self.root.with_file_name("scratch");
        fs::create_dir_all(&path).unwrap();
        path
    }

    /// Default output root of the adjacent placement.
    pub fn defaced(&self) -> Utf8PathBuf {
        self.root.with_file_name("bids_defaced")
    }

    /// Empty directory without a descriptor.
    pub fn bare() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().join("bids")).unwrap();
        fs::create_dir_all(&root).unwrap();
        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn write(&self, relative: &str, text: &str) -> Utf8PathBuf {
        let path = self.root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, text).unwrap();
        path
    }

    pub fn file(&self, relative: &str) -> Utf8PathBuf {
        self.write(relative, "image")
    }

    pub fn anat(&self, sub: &str, ses: Option<&str>) -> Utf8PathBuf {
        self.image(sub, ses, "anat", "", "T1w")
    }

    pub fn pet(&self, sub: &str, ses: Option<&str>, trc: Option<&str>) -> Utf8PathBuf {
        let extra = trc.map(|t| format!("_trc-{t}")).unwrap_or_default();
        self.image(sub, ses, "pet", &extra, "pet")
    }

    fn image(&self, sub: &str, ses: Option<&str>, datatype: &str, extra: &str, suffix: &str) -> Utf8PathBuf {
        let (dir, stem) = match ses {
            Some(ses) => (
                format!("sub-{sub}/ses-{ses}/{datatype}"),
                format!("sub-{sub}_ses-{ses}{extra}_{suffix}"),
            ),
            None => (format!("sub-{sub}/{datatype}"), format!("sub-{sub}{extra}_{suffix}")),
        };

        self.write(&format!("{dir}/{stem}.json"), "{}");
        self.file(&format!("{dir}/{stem}.nii.gz"))
    }
}

/// Stands in for the external tools: writes every expected output unless the
/// task name matches one of the configured failures.
#[derive(Default)]
pub struct Scripted {
    fail: HashSet<String>,
    ran: Mutex<Vec<String>>,
}

impl Scripted {
    pub fn failing<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            fail: names.into_iter().map(Into::into).collect(),
            ran: Mutex::default(),
        }
    }

    /// Names of the executed tasks, in the order they started.
    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }

    pub fn position(&self, name: &str) -> usize {
        self.ran()
            .iter()
            .position(|ran| ran == name)
            .unwrap_or_else(|| panic!("{name} never ran"))
    }
}

impl Executor for Scripted {
    fn execute(&self, task: &Task) -> Result<(), ToolInvocationError> {
        let name = task.name();
        self.ran.lock().unwrap().push(name.clone());

        if self.fail.contains(&name) {
            return Err(ToolInvocationError::ExitStatus {
                program: "scripted".into(),
                status: "exit status: 1".into(),
                stderr: format!("{name} failed on purpose"),
            });
        }

        for output in task.kind.outputs() {
            fs::write(output, "defaced").map_err(|source| ToolInvocationError::Stage {
                path: output.to_path_buf(),
                source,
            })?;
        }

        Ok(())
    }
}
