// src/main.rs

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use dir2sif::{BuildOptions, RemapRules, SifPatcher, Sqfstar, WalkPolicy, build_overlay};
use tracing::info;

fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the compressor
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let options = BuildOptions {
        sources: cli.paths,
        rules: RemapRules::from(cli.replacements),
        env: cli.env,
        temp_dir: cli.temp_dir,
        walk_policy: if cli.strict {
            WalkPolicy::Strict
        } else {
            WalkPolicy::BestEffort
        },
        ..BuildOptions::new(cli.base, cli.output)
    };

    let sqfstar = Sqfstar::locate(&cli.sqfstar)?;
    let report = build_overlay(&options, &sqfstar, &SifPatcher)
        .with_context(|| format!("Failed to build {}", options.output.display()))?;

    info!(
        "Wrote {} ({} entries from {} source trees)",
        options.output.display(),
        report.assembly.entries(),
        options.sources.len()
    );
    Ok(())
}
