//! Refit the SHMS reconstruction matrix from sieve-slit calibration runs.
//!
//! Reads a JSON calibration config naming the old matrix pair and one event
//! file per run, reconstructs and labels every event, and writes the refitted
//! matrix pair next to the configured output base.
//!
//! Usage:
//! ```text
//! shms_optics calibration.json
//! shms_optics calibration.json --dump-dir fit_dump --strict --log-level debug
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shms_optics::matrix::io::{write_fit_matrix, write_fit_vector};
use shms_optics::matrix::TargetCoordinate;
use shms_optics::{Calibration, CalibrationConfig, CsvEventSource, EventSource, Progress, Stage};

#[derive(Parser)]
#[command(name = "shms_optics")]
#[command(about = "Iterative optics calibration of the SHMS reconstruction matrix")]
#[command(version)]
struct Args {
    /// Calibration config (JSON)
    config: PathBuf,

    /// Directory for the xpVec.txt / xpMat.txt normal-equation dumps
    #[arg(long, value_name = "DIR")]
    dump_dir: Option<PathBuf>,

    /// Refuse to write the new matrix if any fit is singular
    #[arg(long)]
    strict: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CalibrationConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let mut calibration = Calibration::from_config(&config)
        .with_context(|| format!("Failed to read matrix {}", config.matrix_file_old.display()))?;

    for run in &config.runs {
        let events = CsvEventSource
            .read_events(run)
            .with_context(|| format!("Failed to read events of run {}", run.run_number))?;
        let summary = calibration.process_run_with_progress(run, &events, &mut |p: Progress| {
            if p.stage == Stage::Accumulate && p.done < p.total {
                info!("Run {}: {} {}/{}", p.run, p.stage, p.done, p.total);
            }
        });
        info!(
            "Run {}: {} read, {} with finite vertex, {} accumulated",
            summary.run_number, summary.events_read, summary.finite_vertex, summary.accumulated
        );
    }

    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        let equations = calibration.normal_equations();
        if let Some(rhs) = equations.rhs(TargetCoordinate::XpTar) {
            write_fit_vector(dir.join("xpVec.txt"), rhs)?;
        }
        write_fit_matrix(dir.join("xpMat.txt"), equations.matrix())?;
        info!("Wrote normal-equation dumps to {}", dir.display());
    }

    let result = calibration.finish();
    info!(
        "Fitted {} terms from {} events",
        result.solution.fits()[0].coefficients.len(),
        result.solution.events()
    );
    if !result.solution.all_solved() {
        if args.strict {
            bail!("singular fit, new matrix not written");
        }
        warn!("Writing matrix from a rank-deficient fit");
    }

    let dependent_path = config.new_dependent_path();
    let independent_path = config.new_independent_path();
    result
        .write(&dependent_path, &independent_path)
        .with_context(|| format!("Failed to write {}", independent_path.display()))?;
    Ok(())
}
