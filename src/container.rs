//! Re-invocation of the pipeline inside a container image, for hosts that
//! lack a FreeSurfer installation.

use std::fmt;
use std::process::{Command, ExitStatus};

use camino::Utf8Path;

use crate::core::{Config, PlacementMode};
use crate::error::ToolInvocationError;
use crate::placement::Placement;

/// Image both runtimes pull the pipeline from.
pub const IMAGE: &str = "openneuropet/petdeface:latest";

const INPUT: &str = "/input";
const OUTPUT: &str = "/output";
const LICENSE: &str = "/opt/freesurfer/license.txt";
const TEMPLATE: &str = "/opt/petdeface/template_T1w.nii.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Docker,
    Singularity,
}

/// A fully assembled container command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl fmt::Display for ContainerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn bind(runtime: Runtime, host: &Utf8Path, guest: &str) -> [String; 2] {
    let flag = match runtime {
        Runtime::Docker => "-v",
        Runtime::Singularity => "--bind",
    };
    [flag.to_string(), format!("{host}:{guest}")]
}

/// Host directory that receives the outputs, when it lies outside the
/// input dataset and therefore needs its own mount.
fn output_mount(config: &Config) -> Option<camino::Utf8PathBuf> {
    match config.placement {
        PlacementMode::Inplace => None,
        PlacementMode::Adjacent => Some(Placement::new(config).primary_root().to_path_buf()),
        PlacementMode::Derivatives => config.output_dir.clone(),
    }
}

/// The pipeline arguments of `config`, rewritten for the container paths.
fn pipeline_args(config: &Config, output: bool) -> Vec<String> {
    let mut args = vec![INPUT.to_string()];

    if output {
        args.extend(["--output_dir".into(), OUTPUT.into()]);
    }

    let placement = match config.placement {
        PlacementMode::Adjacent => "adjacent",
        PlacementMode::Inplace => "inplace",
        PlacementMode::Derivatives => "derivatives",
    };
    args.extend(["--placement".into(), placement.into()]);
    args.extend(["--n_procs".into(), config.workers().to_string()]);

    let selection = &config.selection;
    for (flag, labels) in [
        ("--participant_label", &selection.include_subjects),
        ("--participant_label_exclude", &selection.exclude_subjects),
        ("--session_label", &selection.include_sessions),
        ("--session_label_exclude", &selection.exclude_sessions),
    ] {
        if !labels.is_empty() {
            args.push(flag.into());
            args.extend(labels.iter().cloned());
        }
    }

    for (flag, set) in [
        ("--anat_only", config.anat_only),
        ("--remove_existing", config.remove_existing),
        ("--preview_pics", config.preview),
        ("--skip_bids_validator", config.skip_validator),
    ] {
        if set {
            args.push(flag.into());
        }
    }

    if let Some(template) = config.template {
        args.extend(["--use_template_anat".into(), template.as_str().into()]);
    }
    if config.toolchain.template_t1.is_some() {
        args.extend(["--template_t1".into(), TEMPLATE.into()]);
    }

    args
}

/// Builds the command that runs the same pipeline inside a container.
pub fn container_command(runtime: Runtime, config: &Config) -> ContainerCommand {
    let output = output_mount(config);
    let license = config.toolchain.license_path().ok();

    let mut args: Vec<String> = match runtime {
        Runtime::Docker => ["run", "-a", "stderr", "-a", "stdout", "--rm"]
            .map(String::from)
            .to_vec(),
        Runtime::Singularity => ["exec", "-e"].map(String::from).to_vec(),
    };

    args.extend(bind(runtime, config.input_dir(), INPUT));
    if let Some(output) = &output {
        args.extend(bind(runtime, output, OUTPUT));
    }
    if let Some(license) = &license {
        args.extend(bind(runtime, license, LICENSE));
    }
    if let Some(template) = &config.toolchain.template_t1 {
        args.extend(bind(runtime, template, TEMPLATE));
    }

    match runtime {
        Runtime::Docker => {
            args.extend(["--platform".into(), "linux/amd64".into(), IMAGE.into()]);
        }
        Runtime::Singularity => {
            args.extend([format!("docker://{IMAGE}"), "petdeface".into()]);
        }
    }

    args.extend(pipeline_args(config, output.is_some()));

    ContainerCommand {
        program: match runtime {
            Runtime::Docker => "docker",
            Runtime::Singularity => "singularity",
        },
        args,
    }
}

/// Runs the container with the terminal attached and waits for it.
pub fn run_container(command: &ContainerCommand) -> Result<ExitStatus, ToolInvocationError> {
    tracing::info!("Running {command}");

    Command::new(command.program)
        .args(&command.args)
        .status()
        .map_err(|source| ToolInvocationError::Spawn {
            program: command.program.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TemplateAnat;

    fn config() -> Config {
        let mut config = Config::new("/data/study");
        config.n_procs = 4;
        config
    }

    #[test]
    fn test_docker_adjacent() {
        let command = container_command(Runtime::Docker, &config());
        assert_eq!(
            command.to_string(),
            "docker run -a stderr -a stdout --rm \
             -v /data/study:/input -v /data/study_defaced:/output \
             --platform linux/amd64 openneuropet/petdeface:latest \
             /input --output_dir /output --placement adjacent --n_procs 4"
        );
    }

    #[test]
    fn test_singularity_inplace_with_flags() {
        let mut config = config();
        config.placement = PlacementMode::Inplace;
        config.anat_only = true;
        config.template = Some(TemplateAnat::Pet);
        config.selection.include_subjects = vec!["01".into(), "02".into()];

        let command = container_command(Runtime::Singularity, &config);
        assert_eq!(command.program, "singularity");
        assert_eq!(
            command.to_string(),
            "singularity exec -e --bind /data/study:/input \
             docker://openneuropet/petdeface:latest petdeface \
             /input --placement inplace --n_procs 4 --participant_label 01 02 \
             --anat_only --use_template_anat pet"
        );
    }

    #[test]
    fn test_derivatives_without_output_dir_needs_no_mount() {
        let mut config = config();
        config.placement = PlacementMode::Derivatives;
        let command = container_command(Runtime::Docker, &config);
        assert!(!command.args.iter().any(|a| a.ends_with(":/output")));

        config.output_dir = Some("/scratch/out".into());
        let command = container_command(Runtime::Docker, &config);
        assert!(command.args.contains(&"/scratch/out:/output".to_string()));
    }
}
