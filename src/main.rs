//! gentl-conformance binary.
//!
//! ```bash
//! gentl-conformance                                   # everything, discovered producers
//! gentl-conformance tFormats --format YUYV
//! gentl-conformance tDevices/verifyAllDevices --simulate
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use gentl_conformance::discovery::{self, DESCRIPTOR_EXTENSION};
use gentl_conformance::mock::MockSubsystem;
use gentl_conformance::{
    logging, resolve, Backend, ConformanceError, HardwareSpecCache, RunSettings, SubsystemSession,
    Summary, TestOrchestrator, V4l2Subsystem,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gentl-conformance")]
#[command(about = "Conformance suite for GenTL producer and camera combinations", long_about = None)]
struct Cli {
    /// Test files or file/point tokens; defaults to all
    tests: Vec<String>,

    /// Producer directory (repeatable); skips discovery
    #[arg(long = "producer", value_name = "DIR")]
    producers: Vec<PathBuf>,

    /// Hardware ID to test (repeatable)
    #[arg(long = "device-id", value_name = "N")]
    device_ids: Vec<u32>,

    /// Pixel format for format tests (repeatable)
    #[arg(long = "format", value_name = "F")]
    formats: Vec<String>,

    /// Settings file (TOML)
    #[arg(long, value_name = "FILE", default_value = "conformance.toml")]
    config: PathBuf,

    /// Results and log directory
    #[arg(long, value_name = "DIR")]
    results: Option<PathBuf>,

    /// Hardware spec cache directory
    #[arg(long, value_name = "DIR")]
    cache: Option<PathBuf>,

    /// Run against simulated producers and cameras
    #[arg(long)]
    simulate: bool,
}

impl Cli {
    fn apply(self, settings: &mut RunSettings) {
        if !self.tests.is_empty() {
            settings.selection = self.tests;
        }
        if !self.producers.is_empty() {
            settings.producer_dirs = Some(self.producers);
        }
        if !self.device_ids.is_empty() {
            settings.device_ids = Some(self.device_ids);
        }
        if !self.formats.is_empty() {
            settings.formats = Some(self.formats);
        }
        if let Some(results) = self.results {
            settings.results_dir = results;
        }
        if let Some(cache) = self.cache {
            settings.cache_dir = cache;
        }
        if self.simulate {
            settings.backend = Backend::Simulated;
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut settings = RunSettings::load(Some(cli.config.as_path()))
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    cli.apply(&mut settings);

    let log_path = logging::init(&settings.results_dir, &settings.log_level)?;
    info!(log = %log_path.display(), backend = ?settings.backend, "conformance run starting");

    let session = match settings.backend {
        Backend::V4l2 => SubsystemSession::new(V4l2Subsystem::new()),
        Backend::Simulated => simulated_session(&mut settings)?,
    };
    let cache = HardwareSpecCache::new(&settings.cache_dir);
    let selection = resolve(&settings.selection);
    if selection.is_empty() {
        warn!(tokens = ?settings.selection, "selection matched no test points");
    }

    let orchestrator = TestOrchestrator::new(&session, &cache, settings.scratch_dir())
        .search_path(settings.search_path().or_else(discovery::search_path_from_env))
        .timing(settings.timing());

    let report = match orchestrator.run(&selection, &settings.parameters()) {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, fatal = err.is_fatal(), "run aborted");
            return Err(err.into());
        }
    };

    let summary = Summary::summarize(&report.results, &report.configurations);
    print!("{}", summary.render());
    println!("Log: {}", log_path.display());
    Ok(summary.exit_code())
}

/// Session over simulated producers.
///
/// Uses the configured producers when there are any, otherwise creates two
/// producer directories under the results directory and points discovery at them.
fn simulated_session(settings: &mut RunSettings) -> Result<SubsystemSession> {
    let producers = if let Some(dirs) = &settings.producer_dirs {
        discovery::from_dirs(dirs)?
    } else if let Some(path) = settings.search_path().or_else(discovery::search_path_from_env) {
        match discovery::discover(&path) {
            Ok(producers) => producers,
            Err(ConformanceError::NoProducersFound(reason)) => {
                warn!(%reason, "no producers on search path, creating simulated ones");
                create_simulated_producers(settings)?
            }
            Err(err) => return Err(err.into()),
        }
    } else {
        create_simulated_producers(settings)?
    };
    Ok(SubsystemSession::new(MockSubsystem::simulated(&producers)))
}

fn create_simulated_producers(
    settings: &mut RunSettings,
) -> Result<Vec<gentl_conformance::ProducerRef>> {
    let root = settings.results_dir.join("simulated");
    let dirs: Vec<PathBuf> = ["producer-a", "producer-b"]
        .iter()
        .map(|name| root.join(name))
        .collect();
    for dir in &dirs {
        write_descriptor(dir)?;
    }
    let joined = env::join_paths(&dirs).context("joining simulated producer paths")?;
    settings.search_path = Some(joined.to_string_lossy().into_owned());
    Ok(discovery::discover(&joined)?)
}

fn write_descriptor(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let descriptor = dir.join(format!("simulated.{DESCRIPTOR_EXTENSION}"));
    fs::write(&descriptor, b"simulated producer\n")
        .with_context(|| format!("writing {}", descriptor.display()))?;
    Ok(())
}
