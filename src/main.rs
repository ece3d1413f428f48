use clap::{Parser, Subcommand};
use std::error::Error;

#[derive(Parser)]
#[command(name = "cipherchat")]
#[command(about = "Encrypted chat relay and client", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Port to bind to (default: 4933)
        #[arg(short, long, default_value_t = cipherchat::DEFAULT_PORT)]
        port: u16,
    },
    /// Connect to a relay as an interactive client
    Connect {
        /// Relay address as host:port
        #[arg(default_value = "127.0.0.1:4933")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve { port } => {
            cipherchat::commands::serve::run(port).await?;
        }
        Commands::Connect { addr } => {
            cipherchat::commands::connect::run(&addr).await?;
        }
    }

    Ok(())
}
