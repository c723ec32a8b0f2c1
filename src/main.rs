use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use schoold::{api, config::Config, db, server};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "schoold")]
#[command(about = "School administration portal backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Create the first administrator account if it does not exist yet
    SeedAdmin {
        #[arg(long)]
        mobile: String,
        #[arg(long, default_value = "Administrator")]
        name: String,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut config = Config::load();

    match cli.command {
        Commands::Serve { port, data_dir } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            server::serve(config).await?;
        }
        Commands::SeedAdmin {
            mobile,
            name,
            data_dir,
        } => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            let conn = db::open_db(&config.data_dir)
                .with_context(|| format!("open database in {}", config.data_dir.display()))?;
            if api::seed_admin(&conn, &mobile, &name)? {
                info!(mobile = %mobile, "administrator created");
                println!("created administrator {mobile}");
            } else {
                println!("administrator {mobile} already exists");
            }
        }
    }
    Ok(())
}
