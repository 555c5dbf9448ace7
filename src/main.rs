mod attributes;
mod classfile;
mod config;
mod descriptor;
mod emit;
mod engine;
mod error;
mod graph;
mod ir;
mod opcodes;
mod prune;
mod report;
mod rta;
mod scan;
#[cfg(test)]
mod testing;

use std::io;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Overrides, Properties, Settings};
use crate::engine::{AnalysisOptions, analyze};
use crate::graph::ClassGraph;
use crate::report::{RunReport, write_report};
use crate::rta::DispatchMode;
use crate::scan::{read_jar, scan_classpath};

/// CLI arguments for jarshake execution.
#[derive(Parser, Debug)]
#[command(
    name = "jarshake",
    about = "Removes classes and methods a JAR's entry point can never reach.",
    version
)]
struct Cli {
    /// Properties file with inputJar, outputJar, mainMethodClass, keepClasses and
    /// noUnusedMethodRemoval. Flags override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Class declaring the `main` entry point, dotted or internal form.
    #[arg(long, value_name = "CLASS")]
    main_class: Option<String>,
    /// Classes kept with all of their methods; repeatable or comma separated.
    #[arg(long, value_name = "CLASSES")]
    keep: Vec<String>,
    /// Drop unused classes only; used classes keep every method.
    #[arg(long)]
    classes_only: bool,
    #[arg(long, value_enum)]
    dispatch: Option<DispatchMode>,
    /// Do not treat class-name-shaped string constants as reflective loads.
    #[arg(long)]
    no_reflection_strings: bool,
    /// Library JARs or class directories used to resolve supertypes.
    #[arg(long, value_name = "PATH")]
    classpath: Vec<PathBuf>,
    /// Write a JSON run report to this file, or `-` for stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    #[arg(long, conflicts_with = "quiet")]
    verbose: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            input: self.input.clone(),
            output: self.output.clone(),
            main_class: self.main_class.clone(),
            keep: self.keep.clone(),
            classes_only: self.classes_only,
            dispatch: self.dispatch,
            no_reflection_strings: self.no_reflection_strings,
            classpath: self.classpath.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    run(cli)
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let properties = match &cli.config {
        Some(path) => Properties::load(path)?,
        None => Properties::default(),
    };
    let settings = Settings::resolve(&properties, cli.overrides())?;

    let started_at = Instant::now();
    let mut report = shake(&settings)?;
    if cli.timing {
        report.elapsed_ms = Some(started_at.elapsed().as_millis());
    }

    report.log_summary();
    if let Some(target) = &cli.report {
        write_report(&report, target)?;
    }
    Ok(())
}

/// Read, analyze, prune and write one archive.
fn shake(settings: &Settings) -> Result<RunReport> {
    if !settings.input.exists() {
        anyhow::bail!("input not found: {}", settings.input.display());
    }
    for entry in &settings.classpath {
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
    }

    let mut contents = read_jar(&settings.input)?;
    let library = scan_classpath(&settings.classpath)?;
    debug!(
        classes = contents.classes.len(),
        library = library.len(),
        "decoded input"
    );

    // Input classes are registered first so they shadow same-named library classes.
    let mut graph = ClassGraph::new();
    for class in std::mem::take(&mut contents.classes) {
        graph.register_class(class);
    }
    for class in library {
        graph.register_external(class);
    }

    let options = AnalysisOptions {
        root: settings.main_class.clone(),
        keep: settings.keep_classes.clone(),
        providers: contents.providers.clone(),
        dispatch: settings.dispatch,
        reflection_strings: settings.reflection_strings,
    };
    info!(dispatch = %options.dispatch, root = %options.root, "analyzing");
    let analysis = analyze(graph, &options)?;
    let plan = prune::plan(&analysis.graph, settings.classes_only);
    let emit = emit::write_jar(&contents, &plan, &settings.output)?;

    Ok(RunReport {
        input: settings.input.clone(),
        output: settings.output.clone(),
        main_class: settings.main_class.clone(),
        dispatch: settings.dispatch,
        classes_only: settings.classes_only,
        analysis: analysis.stats,
        prune: plan.stats,
        emit,
        undecodable: contents.undecodable,
        elapsed_ms: None,
    })
}
