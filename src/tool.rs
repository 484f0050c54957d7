//! Adapter around the external imaging tools.
//!
//! Translating a task into command lines is pure ([`Toolchain::plan`]), so it
//! can be checked without FreeSurfer installed. Running them is behind the
//! [`Executor`] trait, which the scheduler is generic over.

use std::fmt;
use std::fs;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{TemplateAnat, Toolchain};
use crate::error::{SetupError, ToolInvocationError};
use crate::io::write_deface_record;
use crate::task::{Task, TaskKind};

/// Lines of stderr kept in a failure diagnostic.
const STDERR_TAIL: usize = 20;

/// Something that can carry out a task. Implementations are shared between
/// the worker threads.
pub trait Executor: Send + Sync {
    fn execute(&self, task: &Task) -> Result<(), ToolInvocationError>;
}

/// One external process call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Outputs written under a temporary name and moved into place once the
    /// process has exited successfully, `(temporary, final)`.
    pub staged: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

impl Invocation {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            staged: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Output argument. When the output overwrites one of the inputs, the
    /// process writes to a sibling file instead.
    fn output(mut self, output: &Utf8Path, inputs: &[&Utf8Path]) -> Self {
        if inputs.contains(&output) {
            let temporary = staging(output);
            self.args.push(temporary.to_string());
            self.staged.push((temporary, output.to_path_buf()));
        } else {
            self.args.push(output.to_string());
        }
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn staging(path: &Utf8Path) -> Utf8PathBuf {
    path.with_file_name(format!("tmp-{}", path.file_name().unwrap_or("output")))
}

impl Toolchain {
    /// Command lines that carry out `task`, in order.
    pub fn plan(&self, task: &Task) -> Vec<Invocation> {
        match &task.kind {
            TaskKind::AnatDeface {
                anat,
                defaced,
                facemask,
            } => vec![
                Invocation::new(&self.mideface)
                    .arg("--i")
                    .arg(anat)
                    .arg("--o")
                    .output(defaced, &[anat.as_path()])
                    .arg("--facemask")
                    .arg(facemask),
            ],
            TaskKind::TemplateSubstitute {
                template,
                source,
                anat,
                facemask,
            } => {
                let synthesize = match template {
                    TemplateAnat::Pet => Invocation::new(&self.mri_concat)
                        .arg("--i")
                        .arg(source)
                        .arg("--mean")
                        .arg("--o")
                        .arg(anat),
                    TemplateAnat::T1 | TemplateAnat::Mni => {
                        Invocation::new(&self.mri_convert).arg(source).arg(anat)
                    }
                };

                let deface = Invocation::new(&self.mideface)
                    .arg("--i")
                    .arg(anat)
                    .arg("--o")
                    .output(anat, &[anat.as_path()])
                    .arg("--facemask")
                    .arg(facemask);

                vec![synthesize, deface]
            }
            // TODO: weight the frames by the FrameDuration of the sidecar
            // instead of a plain mean.
            TaskKind::Register {
                moving,
                average,
                reference,
                transform,
            } => vec![
                Invocation::new(&self.mri_concat)
                    .arg("--i")
                    .arg(moving)
                    .arg("--mean")
                    .arg("--o")
                    .arg(average),
                Invocation::new(&self.mri_coreg)
                    .arg("--mov")
                    .arg(average)
                    .arg("--ref")
                    .arg(reference)
                    .arg("--reg")
                    .arg(transform),
            ],
            TaskKind::ModalityDeface {
                image,
                facemask,
                transform,
                defaced,
                ..
            } => vec![
                Invocation::new(&self.mideface)
                    .arg("--apply")
                    .arg(image)
                    .arg(facemask)
                    .arg(transform)
                    .output(defaced, &[image.as_path()]),
            ],
            TaskKind::Preview {
                original,
                defaced,
                before,
                after,
            } => {
                let mut invocations = Vec::new();
                if let (Some(original), Some(before)) = (original, before) {
                    invocations.push(render(&self.slicer, original, before));
                }
                invocations.push(render(&self.slicer, defaced, after));
                invocations
            }
        }
    }

    /// Environment passed to every tool, so the FreeSurfer binaries find
    /// their installation and license without relying on the caller's shell.
    fn environment(&self) -> Vec<(&'static str, &Utf8Path)> {
        let mut env = Vec::new();
        if let Some(home) = &self.freesurfer_home {
            env.push(("FREESURFER_HOME", home.as_path()));
        }
        if let Some(license) = &self.license {
            env.push(("FS_LICENSE", license.as_path()));
        }
        env
    }

    fn run(&self, invocation: &Invocation) -> Result<(), ToolInvocationError> {
        tracing::debug!("{invocation}");

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(self.environment())
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ToolInvocationError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        if !output.status.success() {
            for (temporary, _) in &invocation.staged {
                let _ = fs::remove_file(temporary);
            }

            return Err(ToolInvocationError::ExitStatus {
                program: invocation.program.clone(),
                status: output.status.to_string(),
                stderr: tail(&output.stderr, STDERR_TAIL),
            });
        }

        for (temporary, target) in &invocation.staged {
            fs::rename(temporary, target).map_err(|source| ToolInvocationError::Stage {
                path: target.clone(),
                source,
            })?;
        }

        Ok(())
    }
}

fn render(slicer: &str, image: &Utf8Path, picture: &Utf8Path) -> Invocation {
    Invocation::new(slicer).arg(image).arg("-a").arg(picture)
}

/// Last `lines` lines of a process stream.
fn tail(stream: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(stream);
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

impl Executor for Toolchain {
    fn execute(&self, task: &Task) -> Result<(), ToolInvocationError> {
        for invocation in self.plan(task) {
            self.run(&invocation)?;
        }

        if let TaskKind::ModalityDeface {
            image,
            facemask,
            transform,
            record,
            ..
        } = &task.kind
        {
            write_deface_record(record, image, facemask, transform).map_err(|source| {
                ToolInvocationError::Stage {
                    path: record.clone(),
                    source,
                }
            })?;
        }

        Ok(())
    }
}

/// Pass/fail gate over the input dataset.
pub fn validate_dataset(toolchain: &Toolchain, root: &Utf8Path) -> Result<(), SetupError> {
    let invocation = Invocation::new(&toolchain.validator).arg(root);
    toolchain.run(&invocation).map_err(SetupError::Validator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(kind: TaskKind) -> Task {
        Task {
            kind,
            subject: "01".into(),
            session: None,
            label: "sub-01_pet".into(),
        }
    }

    fn line(invocation: &Invocation) -> String {
        invocation.to_string()
    }

    #[test]
    fn test_plan_anat_deface() {
        let toolchain = Toolchain::default();
        let plan = toolchain.plan(&task(TaskKind::AnatDeface {
            anat: "/in/T1w.nii.gz".into(),
            defaced: "/out/T1w.nii.gz".into(),
            facemask: "/out/mask.nii.gz".into(),
        }));

        assert_eq!(plan.len(), 1);
        assert_eq!(
            line(&plan[0]),
            "mideface --i /in/T1w.nii.gz --o /out/T1w.nii.gz --facemask /out/mask.nii.gz"
        );
        assert!(plan[0].staged.is_empty());
    }

    #[test]
    fn test_plan_stages_inplace_outputs() {
        let toolchain = Toolchain::default();
        let plan = toolchain.plan(&task(TaskKind::ModalityDeface {
            image: "/in/pet/sub-01_pet.nii.gz".into(),
            facemask: "/d/mask.nii.gz".into(),
            transform: "/d/reg.lta".into(),
            defaced: "/in/pet/sub-01_pet.nii.gz".into(),
            record: "/d/sub-01_desc-defaced_pet.json".into(),
        }));

        assert_eq!(
            line(&plan[0]),
            "mideface --apply /in/pet/sub-01_pet.nii.gz /d/mask.nii.gz /d/reg.lta /in/pet/tmp-sub-01_pet.nii.gz"
        );
        assert_eq!(
            plan[0].staged,
            vec![(
                Utf8PathBuf::from("/in/pet/tmp-sub-01_pet.nii.gz"),
                Utf8PathBuf::from("/in/pet/sub-01_pet.nii.gz")
            )]
        );
    }

    #[test]
    fn test_plan_template_substitute() {
        let toolchain = Toolchain::default();

        let plan = toolchain.plan(&task(TaskKind::TemplateSubstitute {
            template: TemplateAnat::Pet,
            source: "/in/pet.nii.gz".into(),
            anat: "/d/anat.nii.gz".into(),
            facemask: "/d/mask.nii.gz".into(),
        }));
        assert_eq!(
            line(&plan[0]),
            "mri_concat --i /in/pet.nii.gz --mean --o /d/anat.nii.gz"
        );
        assert_eq!(
            line(&plan[1]),
            "mideface --i /d/anat.nii.gz --o /d/tmp-anat.nii.gz --facemask /d/mask.nii.gz"
        );

        let plan = toolchain.plan(&task(TaskKind::TemplateSubstitute {
            template: TemplateAnat::Mni,
            source: "/fs/average/mni305.cor.mgz".into(),
            anat: "/d/anat.nii.gz".into(),
            facemask: "/d/mask.nii.gz".into(),
        }));
        assert_eq!(
            line(&plan[0]),
            "mri_convert /fs/average/mni305.cor.mgz /d/anat.nii.gz"
        );
    }

    #[test]
    fn test_plan_register_and_preview() {
        let toolchain = Toolchain {
            slicer: "/opt/fsl/bin/slicer".into(),
            ..Toolchain::default()
        };

        let plan = toolchain.plan(&task(TaskKind::Register {
            moving: "/in/pet.nii.gz".into(),
            average: "/d/wavg.nii.gz".into(),
            reference: "/out/T1w.nii.gz".into(),
            transform: "/d/reg.lta".into(),
        }));
        assert_eq!(plan.len(), 2);
        assert_eq!(
            line(&plan[0]),
            "mri_concat --i /in/pet.nii.gz --mean --o /d/wavg.nii.gz"
        );
        // the frame average is registered, never the dynamic image
        assert_eq!(
            line(&plan[1]),
            "mri_coreg --mov /d/wavg.nii.gz --ref /out/T1w.nii.gz --reg /d/reg.lta"
        );

        let plan = toolchain.plan(&task(TaskKind::Preview {
            original: None,
            defaced: "/in/T1w.nii.gz".into(),
            before: None,
            after: "/d/after.png".into(),
        }));
        assert_eq!(plan.len(), 1);
        assert_eq!(line(&plan[0]), "/opt/fsl/bin/slicer /in/T1w.nii.gz -a /d/after.png");
    }

    #[test]
    fn test_tail() {
        let stream = (1..=30).map(|i| format!("line {i}\n")).collect::<String>();
        assert_eq!(tail(stream.as_bytes(), 3), "line 28\nline 29\nline 30");
        assert_eq!(tail(b"", 3), "");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_and_spawn_errors() {
        let register = task(TaskKind::Register {
            moving: "/in/pet.nii.gz".into(),
            average: "/d/wavg.nii.gz".into(),
            reference: "/out/T1w.nii.gz".into(),
            transform: "/d/reg.lta".into(),
        });

        let toolchain = Toolchain {
            mri_concat: "true".into(),
            mri_coreg: "true".into(),
            ..Toolchain::default()
        };
        assert!(toolchain.execute(&register).is_ok());

        let toolchain = Toolchain {
            mri_concat: "true".into(),
            mri_coreg: "false".into(),
            ..Toolchain::default()
        };
        assert!(matches!(
            toolchain.execute(&register),
            Err(ToolInvocationError::ExitStatus { .. })
        ));

        let toolchain = Toolchain {
            mri_concat: "petdeface-no-such-program".into(),
            ..Toolchain::default()
        };
        assert!(matches!(
            toolchain.execute(&register),
            Err(ToolInvocationError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_modality_deface_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let record = root.join("sub-01_desc-defaced_pet.json");

        let toolchain = Toolchain {
            mideface: "true".into(),
            ..Toolchain::default()
        };
        toolchain
            .execute(&task(TaskKind::ModalityDeface {
                image: "/in/pet/sub-01_pet.nii.gz".into(),
                facemask: "/d/mask.nii.gz".into(),
                transform: "/d/reg.lta".into(),
                defaced: root.join("sub-01_pet.nii.gz"),
                record: record.clone(),
            }))
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&record).unwrap()).unwrap();
        assert_eq!(json["Sources"][0], "/in/pet/sub-01_pet.nii.gz");
        assert_eq!(json["Sources"][2], "/d/reg.lta");
        assert_eq!(json["GeneratedBy"][0]["Name"], "petdeface");
    }

    #[cfg(unix)]
    #[test]
    fn test_validator_gate() {
        let toolchain = Toolchain {
            validator: "false".into(),
            ..Toolchain::default()
        };
        assert!(matches!(
            validate_dataset(&toolchain, Utf8Path::new("/data")),
            Err(SetupError::Validator(_))
        ));
    }
}
