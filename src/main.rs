use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use udpshipper::config::resolve_config_path;

#[derive(Parser)]
#[command(name = "udpshipper")]
#[command(about = "Tail log files and ship each line as a UDP datagram", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the shipper until SIGINT or SIGTERM
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a documented starter config
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Load and validate the config without starting
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "udpshipper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            udpshipper::cli::run::run(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                udpshipper::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                udpshipper::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}
