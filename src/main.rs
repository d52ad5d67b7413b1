use clap::Parser;
use deadman::config::{DeadmanConfig, FirePolicy};
use deadman::{signals, supervise};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Run a command under a liveness watchdog: every line it prints is a feed,
/// and if it stays silent past the timeout its process group is killed.
#[derive(Parser, Debug)]
#[command(name = "deadman", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "deadman.toml")]
    config: PathBuf,

    /// Liveness timeout in milliseconds (overrides config)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Check interval in milliseconds (overrides config)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Fire policy: once (per breach) or every-tick (overrides config)
    #[arg(long)]
    fire: Option<FirePolicy>,

    /// Keep the watchdog disabled until the command first prints something
    #[arg(long)]
    arm_on_first_output: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog ticks, gate changes)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Command to supervise, after `--`
    #[arg(last = true, required_unless_present = "dry_run")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("deadman: {e}");
            2
        }
    };
    std::process::exit(code);
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "deadman=debug"
    } else if cli.quiet {
        "deadman=warn"
    } else {
        "deadman=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Merge CLI overrides into the file config.
fn apply_overrides(config: &mut DeadmanConfig, cli: &Cli) {
    if let Some(timeout) = cli.timeout_ms {
        config.watchdog.timeout_ms = timeout;
    }
    if let Some(interval) = cli.interval_ms {
        config.watchdog.check_interval_ms = interval;
    }
    if let Some(fire) = cli.fire {
        config.watchdog.fire = fire;
    }
    if cli.arm_on_first_output {
        config.supervise.arm_on_first_output = true;
    }
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = DeadmanConfig::load(&cli.config)?;
    apply_overrides(&mut config, &cli);
    config.validate()?;

    if cli.dry_run {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(0);
    }

    let (command, args) = cli.command.split_first().ok_or("no command given")?;

    let shutdown = CancellationToken::new();
    signals::install(shutdown.clone())?;

    let outcome = supervise::run(command, args, &config, shutdown).await?;
    if outcome.timed_out {
        tracing::error!(
            command = %command,
            timeout_ms = config.watchdog.timeout_ms,
            "watchdog timeout: {command} went silent, killed"
        );
    }
    Ok(outcome.exit_status(config.supervise.timeout_exit_code))
}
