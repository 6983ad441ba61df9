mod files;
mod script;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use tracing::info;
use vsolve_core::variables::Registry;
use vsolve_core::EngineConfig;

#[derive(Parser)]
#[command(name = "vsolve")]
#[command(about = "Run solution variable scripts", version)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace to load before running the script
    #[arg(long)]
    load: Option<PathBuf>,

    /// Write the workspace here afterwards
    #[arg(long)]
    save: Option<PathBuf>,

    /// Script file; reads standard input when omitted
    script: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => files::load_config(path)?,
        None => EngineConfig::default(),
    };
    let registry = match &cli.load {
        Some(path) => files::load_workspace(path, config)?,
        None => Registry::with_config(config),
    };

    let script = match &cli.script {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?,
        None => io::read_to_string(io::stdin()).context("reading standard input")?,
    };

    let mut session = script::Session::new(registry);
    let failures = session.run(&script, &mut io::stdout().lock())?;
    info!("Script finished with {} failed lines", failures);

    if let Some(path) = &cli.save {
        files::save_workspace(session.registry(), path)?;
    }
    if failures > 0 {
        bail!("{} line(s) failed", failures);
    }
    Ok(())
}
