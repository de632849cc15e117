//! Point d'entrée de landuse-cn
//!
//! Le projet est lu depuis `LANDUSE_CN_PROJECT` (variable d'environnement ou `.env`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use curvenumber::CancellationToken;
use landuse_cn::{Pipeline, ProjectConfig};

// Charger .env au démarrage
fn load_env() {
    if dotenvy::dotenv().is_err() {
        // Essayer depuis le répertoire du binaire
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let _ = dotenvy::from_path(dir.join(".env"));
            }
        }
    }
}

fn main() -> Result<()> {
    load_env();

    let verbose = std::env::var("LANDUSE_CN_VERBOSE")
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(0);
    let quiet = std::env::var("LANDUSE_CN_QUIET")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    init_logging(verbose, quiet);

    let project = std::env::var("LANDUSE_CN_PROJECT")
        .map(PathBuf::from)
        .context("LANDUSE_CN_PROJECT is not set")?;
    let config = ProjectConfig::load(&project)?;
    info!(project = %project.display(), "Project loaded");

    let token = CancellationToken::new();
    let report = Pipeline::run(&config, &token)?;

    report.display();
    let report_path = config.output_dir.join("report.json");
    report.save_to_file(&report_path)?;
    info!(report = %report_path.display(), "Report saved");

    if report.is_failed() {
        bail!("{}", report.summary());
    }
    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::WARN,
        (_, 0) => Level::INFO,
        (_, 1) => Level::DEBUG,
        (_, _) => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}
