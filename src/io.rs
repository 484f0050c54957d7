use std::fmt::Display;
use std::fs;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;
use indicatif::ProgressStyle;
use serde::Serialize;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{BIDS_VERSION, PIPELINE};
use crate::dataset::{DESCRIPTOR, DatasetIndex};

const ANSI_BLUE: Style = Style::new().blue();

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Style of the bar tracking the whole batch.
pub(crate) fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Style of a single running task, no progress.
pub(crate) fn task_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("  {spinner:.blue} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn is_image(name: &str) -> bool {
    name.ends_with(".nii") || name.ends_with(".nii.gz")
}

/// Copies everything but imaging data from the input dataset into `dst`.
///
/// NIfTI images are never copied, whether indexed or not. The defaced ones
/// are written by the tasks, so a failed task never leaves a face behind.
/// Existing derivatives of the input are left out as well.
pub fn mirror_dataset(index: &DatasetIndex, dst: &Utf8Path) -> std::io::Result<u64> {
    let s = Instant::now();

    let span = tracing::span!(Level::INFO, "mirror");
    span.pb_set_style(&task_style());
    span.pb_set_message("Copying metadata...");
    let _enter = span.enter();

    let mut copied = 0;
    copy_rec(&index.root, dst, dst, true, &mut copied)?;

    tracing::info!("Copied {copied} metadata files to {dst} {}", as_overhead(s));
    Ok(copied)
}

fn copy_rec(
    src: &Utf8Path,
    dst: &Utf8Path,
    skip: &Utf8Path,
    root: bool,
    copied: &mut u64,
) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();

        // output folder nested in the input
        if path == skip {
            continue;
        }

        let filetype = entry.file_type()?;
        if filetype.is_dir() {
            if root && name == "derivatives" {
                continue;
            }
            copy_rec(path, &dst.join(name), skip, false, copied)?;
        } else if !is_image(name) {
            fs::copy(path, dst.join(name))?;
            *copied += 1;
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct GeneratedBy<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Version")]
    version: &'a str,
}

#[derive(Serialize)]
struct SourceDataset<'a> {
    #[serde(rename = "URL")]
    url: String,
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct DerivativesDescriptor<'a> {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "BIDSVersion")]
    bids_version: &'a str,
    #[serde(rename = "DatasetType")]
    dataset_type: &'a str,
    #[serde(rename = "GeneratedBy")]
    generated_by: Vec<GeneratedBy<'a>>,
    #[serde(rename = "SourceDatasets")]
    source_datasets: Vec<SourceDataset<'a>>,
}

#[derive(Serialize)]
struct DefaceRecord<'a> {
    #[serde(rename = "Description")]
    description: &'a str,
    /// Defaced image, face mask and transform.
    #[serde(rename = "Sources")]
    sources: [&'a Utf8Path; 3],
    #[serde(rename = "GeneratedBy")]
    generated_by: Vec<GeneratedBy<'a>>,
}

/// Writes the provenance JSON of a defaced PET image to `path`.
pub(crate) fn write_deface_record(
    path: &Utf8Path,
    image: &Utf8Path,
    facemask: &Utf8Path,
    transform: &Utf8Path,
) -> std::io::Result<()> {
    let record = DefaceRecord {
        description: "Face mask of the anatomical image applied through the registration",
        sources: [image, facemask, transform],
        generated_by: vec![GeneratedBy {
            name: PIPELINE,
            version: env!("CARGO_PKG_VERSION"),
        }],
    };

    fs::write(path, serde_json::to_string_pretty(&record)?)
}

/// Writes `dataset_description.json` into the derivatives root.
pub fn write_derivatives_descriptor(index: &DatasetIndex, root: &Utf8Path) -> std::io::Result<()> {
    let source = index.descriptor.name.as_deref();

    let descriptor = DerivativesDescriptor {
        name: match source {
            Some(name) => format!("{PIPELINE} outputs for {name}"),
            None => format!("{PIPELINE} outputs"),
        },
        bids_version: index
            .descriptor
            .bids_version
            .as_deref()
            .unwrap_or(BIDS_VERSION),
        dataset_type: "derivative",
        generated_by: vec![GeneratedBy {
            name: PIPELINE,
            version: env!("CARGO_PKG_VERSION"),
        }],
        source_datasets: vec![SourceDataset {
            url: format!("file://{}", index.root),
            name: source,
        }],
    };

    let json = serde_json::to_string_pretty(&descriptor)?;
    fs::create_dir_all(root)?;
    fs::write(root.join(DESCRIPTOR), json)
}
