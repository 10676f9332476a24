use anyhow::{Context, Result};
use clap::Parser;
use netload::cli::{Args, TestConfig};
use netload::{execute, logging, CancelToken};
use tracing::{debug, error};

fn main() -> Result<()> {
    let args = Args::parse();
    let config = TestConfig::from_args(&args)?;

    // The guard keeps the non-blocking file writer alive until exit.
    let _guard = logging::init(config.verbose, config.structured, args.log_file.as_deref())?;

    let mut cancel = CancelToken::new();
    cancel
        .install_signal_handler()
        .context("Failed to install signal handlers")?;

    debug!("netload {} starting", netload::VERSION);

    let structured = config.structured;
    let outcome = execute(config, cancel);

    if structured {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    }
    if let Some(path) = &args.output_file {
        outcome
            .report
            .write_to_file(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    if outcome.status < 0 {
        error!("Test failed: {}", outcome.report.error);
        std::process::exit(1);
    }
    Ok(())
}
