use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::emit::EmitStats;
use crate::engine::AnalysisStats;
use crate::prune::PruneStats;
use crate::rta::DispatchMode;

/// Machine-readable summary of one run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunReport {
    pub(crate) input: PathBuf,
    pub(crate) output: PathBuf,
    pub(crate) main_class: String,
    pub(crate) dispatch: DispatchMode,
    pub(crate) classes_only: bool,
    pub(crate) analysis: AnalysisStats,
    pub(crate) prune: PruneStats,
    pub(crate) emit: EmitStats,
    pub(crate) undecodable: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) elapsed_ms: Option<u128>,
}

impl RunReport {
    pub(crate) fn log_summary(&self) {
        let analysis = &self.analysis;
        info!(
            "Total classes: {}, Visited: {}, Used: {}",
            analysis.classes_total, analysis.classes_visited, analysis.classes_used
        );
        info!(
            "Total methods: {}, Used: {}, Instantiated classes: {}",
            analysis.methods_total, analysis.methods_used, analysis.instantiated
        );
        if self.dispatch == DispatchMode::ChaPrune {
            info!(
                "Retracted edges: {}, methods: {}, classes: {}",
                analysis.retraction.edges, analysis.retraction.methods, analysis.retraction.classes
            );
        }
        info!(
            output = %self.output.display(),
            entries = self.emit.entries_written,
            "Removed {} classes and {} methods",
            self.prune.dropped_classes,
            self.prune.removed_methods
        );
        if let Some(elapsed) = self.elapsed_ms {
            info!("timing: total_ms={elapsed}");
        }
    }
}

/// Write `report` as pretty JSON to `target`; `-` means stdout.
pub(crate) fn write_report(report: &RunReport, target: &Path) -> Result<()> {
    let mut writer = report_writer(target)?;
    serde_json::to_writer_pretty(&mut writer, report).context("failed to serialize run report")?;
    writer
        .write_all(b"\n")
        .context("failed to write run report")?;
    writer.flush().context("failed to write run report")
}

fn report_writer(target: &Path) -> Result<Box<dyn Write>> {
    if target == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    let file = File::create(target).with_context(|| format!("failed to open {}", target.display()))?;
    Ok(Box::new(file))
}
