use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::classfile::retain_methods;
use crate::prune::{ClassVerdict, PrunePlan};
use crate::scan::JarContents;

#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct EmitStats {
    pub(crate) entries_written: usize,
    pub(crate) classes_copied: usize,
    pub(crate) classes_rewritten: usize,
    pub(crate) classes_dropped: usize,
    pub(crate) signatures_removed: usize,
}

/// Write the pruned archive to `output`, keeping the input entry order.
pub(crate) fn write_jar(contents: &JarContents, plan: &PrunePlan, output: &Path) -> Result<EmitStats> {
    let file = File::create(output).with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut stats = EmitStats::default();

    for entry in &contents.entries {
        if entry.is_dir {
            writer
                .add_directory(entry.name.as_str(), options)
                .with_context(|| format!("failed to write {}", entry.name))?;
            stats.entries_written += 1;
            continue;
        }
        if is_signature_file(&entry.name) {
            debug!(entry = %entry.name, "dropping signature file");
            stats.signatures_removed += 1;
            continue;
        }

        let verdict = entry
            .class_name
            .as_deref()
            .and_then(|class_name| plan.verdict(class_name));
        let data = match verdict {
            Some(ClassVerdict::Drop) => {
                stats.classes_dropped += 1;
                continue;
            }
            Some(verdict @ ClassVerdict::Keep(_)) => {
                stats.classes_rewritten += 1;
                retain_methods(&entry.data, |name, descriptor| verdict.keeps_method(name, descriptor))
                    .with_context(|| format!("failed to rewrite {}", entry.name))?
            }
            Some(ClassVerdict::KeepAll) => {
                stats.classes_copied += 1;
                entry.data.clone()
            }
            None => entry.data.clone(),
        };
        writer
            .start_file(entry.name.as_str(), options)
            .with_context(|| format!("failed to write {}", entry.name))?;
        writer
            .write_all(&data)
            .with_context(|| format!("failed to write {}", entry.name))?;
        stats.entries_written += 1;
    }

    writer
        .finish()
        .with_context(|| format!("failed to finish {}", output.display()))?;
    Ok(stats)
}

/// JAR signature material; stale once any entry changes.
fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    [".SF", ".RSA", ".DSA", ".EC"]
        .iter()
        .any(|suffix| upper.ends_with(suffix))
}
