use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nestegg::core::{simulate_with, ParamPack, RunOptions, Scenario};

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Monte Carlo retirement simulator with fat-tailed market returns"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run a single scenario from a JSON file and print the summary
    Run {
        scenario: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
        /// Optional jump calibration pack (kou_params_v1 JSON)
        #[arg(long)]
        params: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port } => {
            if let Err(e) = nestegg::api::run_http_server(port).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Run {
            scenario,
            seed,
            params,
        } => {
            let text = match std::fs::read_to_string(&scenario) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("Cannot read {}: {e}", scenario.display());
                    std::process::exit(1);
                }
            };
            let scenario: Scenario = match serde_json::from_str(&text) {
                Ok(scenario) => scenario,
                Err(e) => {
                    eprintln!("Invalid scenario JSON: {e}");
                    std::process::exit(1);
                }
            };
            let pack = match params.map(|p| ParamPack::load(&p)).transpose() {
                Ok(pack) => pack,
                Err(e) => {
                    eprintln!("Invalid parameter pack: {e}");
                    std::process::exit(1);
                }
            };
            let options = RunOptions {
                seed,
                params: pack,
                ..RunOptions::default()
            };
            match simulate_with(&scenario, &options) {
                Ok(result) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&result).expect("result serializes")
                    );
                }
                Err(e) => {
                    eprintln!("Simulation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
