use anyhow::Result;
use clap::Parser;
use driftbay_gateway::{DriftBayServer, ServerConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    bind_address: String,

    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    #[arg(long, default_value = "sqlite:./driftbay.db")]
    database_url: String,

    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[arg(long, default_value = "./scratch")]
    scratch_dir: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value_t = 24)]
    session_retention_hours: i64,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = args.config {
        let config_content = tokio::fs::read_to_string(&config_path).await?;
        toml::from_str(&config_content)?
    } else {
        ServerConfig {
            bind_address: args.bind_address,
            port: args.port,
            database_url: args.database_url,
            data_dir: args.data_dir,
            scratch_dir: args.scratch_dir,
            log_level: args.log_level,
            session_retention_hours: args.session_retention_hours,
            ..ServerConfig::default()
        }
    };

    let server = DriftBayServer::new(config);
    server.run().await
}
