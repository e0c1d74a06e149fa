use std::path::PathBuf;

use clap::{Parser, Subcommand};

use wealthcast::api;
use wealthcast::core::{
    Cma, CmaOverride, ClientPortfolio, McConfig, PortfolioDescription, run_simulation,
};

#[derive(Parser, Debug)]
#[command(
    name = "wealthcast",
    about = "Monte Carlo goal-probability engine for client portfolios"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one simulation from a portfolio description file and print the
    /// JSON result to stdout.
    Run {
        /// Portfolio description (JSON).
        #[arg(long)]
        portfolio: PathBuf,
        /// Optional CMA override file: {"mu_ann"?, "vol_ann"?, "corr"?}.
        #[arg(long)]
        cma: Option<PathBuf>,
        #[arg(long, default_value_t = 10_000)]
        paths: usize,
        #[arg(long)]
        seed: Option<u64>,
        /// Skip the percentile trajectories.
        #[arg(long)]
        no_percentiles: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port } => {
            if let Err(e) = api::run_http_server(port).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Run { portfolio, cma, paths, seed, no_percentiles } => {
            if let Err(e) = run_once(&portfolio, cma.as_deref(), paths, seed, no_percentiles) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn run_once(
    portfolio_path: &std::path::Path,
    cma_path: Option<&std::path::Path>,
    paths: usize,
    seed: Option<u64>,
    no_percentiles: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(portfolio_path)?;
    let description: PortfolioDescription = serde_json::from_str(&raw)?;
    let portfolio = ClientPortfolio::from_description(description);

    let cma = match cma_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            let overrides: CmaOverride = serde_json::from_str(&raw)?;
            Cma::with_overrides(&overrides)?
        }
        None => Cma::baseline(),
    };

    let config = McConfig {
        n_paths: paths,
        seed: seed.or(Some(42)),
        store_percentiles: !no_percentiles,
        ..McConfig::default()
    };
    let result = run_simulation(&portfolio, &cma, &config)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
