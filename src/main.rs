use clap::{Parser, Subcommand};
use dap_bridge::Result;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dap_bridge")]
#[command(about = "DAP protocol bridge for tool-call debugging", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge listening on STDIO
    Serve {
        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Set log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { verbose, log_level } => {
            let level = if verbose { "debug" } else { &log_level };
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();

            dap_bridge::serve().await?;
        }
    }

    Ok(())
}
