//! Quality assurance page listing the before/after previews.

use std::fmt::{self, Display, Formatter, Write};
use std::fs;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ToolInvocationError;
use crate::scheduler::{BatchReport, SkipReason, TaskState};
use crate::task::TaskKind;

/// Previews of one defaced anatomical image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewEntry {
    pub subject: String,
    pub session: Option<String>,
    pub label: String,
    pub before: Option<Utf8PathBuf>,
    pub after: Utf8PathBuf,
}

struct XmlSafe<'a>(&'a str);

impl<'a> Display for XmlSafe<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

/// Previews whose task succeeded now or in an earlier run.
pub fn collect(report: &BatchReport) -> Vec<PreviewEntry> {
    report
        .outcomes
        .iter()
        .filter(|o| {
            matches!(
                o.state,
                TaskState::Succeeded | TaskState::Skipped(SkipReason::UpToDate)
            )
        })
        .filter_map(|o| match &o.task.kind {
            TaskKind::Preview { before, after, .. } => Some(PreviewEntry {
                subject: o.task.subject.clone(),
                session: o.task.session.clone(),
                label: o.task.label.clone(),
                before: before.clone(),
                after: after.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Link to `target` from a page in `dir`.
fn href(dir: &Utf8Path, target: &Utf8Path) -> String {
    match dir.parent().and_then(|parent| target.strip_prefix(parent).ok()) {
        Some(relative) => format!("../{relative}"),
        None => format!("file://{target}"),
    }
}

pub fn render_index(entries: &[PreviewEntry], dir: &Utf8Path) -> String {
    let mut html = String::with_capacity(1024 + entries.len() * 400);
    let _ = write_index(&mut html, entries, dir);
    html
}

fn write_index(buf: &mut String, entries: &[PreviewEntry], dir: &Utf8Path) -> fmt::Result {
    let css = r#"
        body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; margin: 20px; background: #f5f5f5; }
        h1 { text-align: center; color: #333; }
        .item { background: white; padding: 10px; margin-bottom: 20px; border-radius: 5px; box-shadow: 0 2px 4px rgba(0, 0, 0, 0.1); }
        .pair { display: flex; gap: 10px; }
        .pair figure { flex: 1; margin: 0; text-align: center; }
        .pair img { max-width: 100%; }"#;

    write!(
        buf,
        r#"<!DOCTYPE html><html><head><meta charset="utf-8"><title>petdeface QA</title><style>{css}</style></head><body><h1>petdeface QA ({} images)</h1>"#,
        entries.len()
    )?;

    for entry in entries {
        let session = entry
            .session
            .as_ref()
            .map(|s| format!(" ses-{s}"))
            .unwrap_or_default();

        write!(
            buf,
            r#"<div class="item"><h2>sub-{}{}: {}</h2><div class="pair">"#,
            XmlSafe(&entry.subject),
            XmlSafe(&session),
            XmlSafe(&entry.label)
        )?;

        if let Some(before) = &entry.before {
            write!(
                buf,
                r#"<figure><img src="{}" alt="before"><figcaption>Before</figcaption></figure>"#,
                XmlSafe(&href(dir, before))
            )?;
        }

        write!(
            buf,
            r#"<figure><img src="{}" alt="after"><figcaption>After</figcaption></figure></div></div>"#,
            XmlSafe(&href(dir, &entry.after))
        )?;
    }

    buf.push_str("</body></html>");
    Ok(())
}

/// Writes `qa/index.html` under `root`. Nothing is written when the batch
/// produced no previews.
pub fn write_qa_page(report: &BatchReport, root: &Utf8Path) -> std::io::Result<Option<Utf8PathBuf>> {
    let entries = collect(report);
    if entries.is_empty() {
        return Ok(None);
    }

    let dir = root.join("qa");
    fs::create_dir_all(&dir)?;

    let path = dir.join("index.html");
    fs::write(&path, render_index(&entries, &dir))?;

    tracing::info!("QA page with {} previews at {path}", entries.len());
    Ok(Some(path))
}

/// Opens `path` with the platform's default handler without waiting for it.
pub fn open_in_browser(path: &Utf8Path) -> Result<(), ToolInvocationError> {
    let program = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };

    Command::new(program)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|source| ToolInvocationError::Spawn {
            program: program.to_string(),
            source,
        })
}
