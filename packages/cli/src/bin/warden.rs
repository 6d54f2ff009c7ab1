use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process;

mod cli;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden - OAuth token lifecycle manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lifecycle manager until interrupted (refreshes, health sweeps, metrics)
    Serve,
    /// Store tokens from a JSON file (one object or an array)
    Import {
        /// Path to the token file
        file: PathBuf,
    },
    /// Show health of every stored token
    Status,
    /// Show aggregated token metrics
    Metrics,
    /// Refresh a token now
    Refresh {
        /// Provider name (google, github, microsoft, zoom, or a custom provider)
        provider: String,
        /// User the token belongs to
        user: String,
    },
    /// Revoke a token at the provider and remove it
    Revoke { provider: String, user: String },
    /// Remove a token locally without contacting the provider
    Remove { provider: String, user: String },
    /// List configured OAuth providers
    Providers,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    warden_cli::init_tracing();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve => cli::serve::serve_command().await,
        Commands::Import { file } => cli::tokens::import_command(&file).await,
        Commands::Status => cli::tokens::status_command().await,
        Commands::Metrics => cli::tokens::metrics_command().await,
        Commands::Refresh { provider, user } => {
            cli::tokens::refresh_command(&provider, &user).await
        }
        Commands::Revoke { provider, user } => cli::tokens::revoke_command(&provider, &user).await,
        Commands::Remove { provider, user } => cli::tokens::remove_command(&provider, &user).await,
        Commands::Providers => cli::tokens::providers_command(),
    }
}
