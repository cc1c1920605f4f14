use std::error::Error;

use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use cleanroom::config::Config;
use cleanroom::sandbox;
use cleanroom::server::{self, AppState};

#[derive(Parser)]
#[command(name = "cleanroom", about = "Policy-constrained microVM sandboxes")]
enum Cli {
    /// Start the control plane (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Listen endpoint: unix:///path or http://host:port
        #[arg(long)]
        listen: Option<String>,
    },
    /// Probe the host for sandbox readiness and print the report
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to serve when invoked bare, keeping --help working.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve { listen: None }
    } else {
        Cli::parse()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cleanroom=info,hyper=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env();

    match cli {
        Cli::Serve { listen } => {
            let registry = sandbox::build_registry(&config);
            let endpoint = listen.unwrap_or_else(|| config.listen.clone());
            server::serve(&endpoint, AppState { registry }).await?;
            Ok(())
        }
        Cli::Doctor => {
            let registry = sandbox::build_registry(&config);
            let reports = registry.doctor().await;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            if reports.iter().all(|r| r.healthy()) {
                Ok(())
            } else {
                std::process::exit(1)
            }
        }
    }
}
