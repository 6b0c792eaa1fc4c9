use anyhow::Result;
use clap::Parser;
use mackerel_plugin_nginx_cache::cli::{report_failure, Cli};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(cli.log_filter()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // stdout belongs to mackerel-agent; diagnostics go to stderr only
            report_failure(&e, &mut std::io::stderr());
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr. RUST_LOG overrides the verbosity flags.
fn setup_logging(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
