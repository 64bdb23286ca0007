use anyhow::Result;
use clap::{Parser, Subcommand};
use driftbay_catalog::{BucketRepository, CatalogService, CreateBucketRequest};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

#[derive(Parser, Debug)]
#[command(author, version, about = "DriftBay CLI - Manage your upload gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "sqlite:./driftbay.db")]
    database_url: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    Bucket {
        #[command(subcommand)]
        command: BucketCommands,
    },
    Scratch {
        #[command(subcommand)]
        command: ScratchCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Create the catalog database and bring its schema up to date.
    Init,
}

#[derive(Subcommand, Debug)]
enum BucketCommands {
    Create {
        name: String,
        #[arg(long, default_value = "us-east-1")]
        region: String,
    },
    List,
    Delete {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ScratchCommands {
    /// Delete upload scratch entries (spools, part directories) older than
    /// the cutoff. Run against a stopped gateway, or with a cutoff well past
    /// the session retention window.
    Sweep {
        #[arg(long, default_value = "./scratch")]
        scratch_dir: PathBuf,
        #[arg(long, default_value_t = 48)]
        older_than_hours: u64,
        #[arg(long, help = "List what would be deleted without deleting")]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Db { command } => {
            handle_db_command(command, &cli.database_url).await?;
        }
        Commands::Bucket { command } => {
            handle_bucket_command(command, &cli.database_url).await?;
        }
        Commands::Scratch { command } => {
            handle_scratch_command(command).await?;
        }
    }

    Ok(())
}

async fn open_catalog(database_url: &str) -> Result<CatalogService> {
    driftbay_catalog::migrations::ensure_database_exists(database_url).await?;
    let catalog = CatalogService::new(database_url).await?;
    driftbay_catalog::migrations::run_migrations(catalog.pool()).await?;
    Ok(catalog)
}

async fn handle_db_command(command: &DbCommands, database_url: &str) -> Result<()> {
    match command {
        DbCommands::Init => {
            open_catalog(database_url).await?;
            println!("Catalog ready at {}", database_url);
        }
    }
    Ok(())
}

async fn handle_bucket_command(command: &BucketCommands, database_url: &str) -> Result<()> {
    let catalog = open_catalog(database_url).await?;
    let repo = BucketRepository::new(catalog.pool().clone());

    match command {
        BucketCommands::Create { name, region } => {
            let request = CreateBucketRequest {
                name: name.clone(),
                region: region.clone(),
            };

            match repo.create(request).await {
                Ok(bucket) => {
                    println!("Created bucket '{}' in region '{}'", bucket.name, bucket.region);
                    println!("  ID: {}", bucket.id);
                    println!("  Created: {}", bucket.created_at);
                }
                Err(e) => {
                    eprintln!("Failed to create bucket: {}", e);
                    std::process::exit(1);
                }
            }
        }
        BucketCommands::List => {
            match repo.list().await {
                Ok(buckets) => {
                    if buckets.is_empty() {
                        println!("No buckets found");
                    } else {
                        println!("Buckets:");
                        for bucket in buckets {
                            println!(
                                "  {} ({})",
                                bucket.name,
                                bucket.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                            );
                        }
                    }
                }
                Err(e) => {
                    eprintln!("Failed to list buckets: {}", e);
                    std::process::exit(1);
                }
            }
        }
        BucketCommands::Delete { name } => {
            match repo.delete(name).await {
                Ok(true) => {
                    println!("Deleted bucket '{}'", name);
                }
                Ok(false) => {
                    eprintln!("Bucket '{}' not found", name);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Failed to delete bucket: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn handle_scratch_command(command: &ScratchCommands) -> Result<()> {
    match command {
        ScratchCommands::Sweep {
            scratch_dir,
            older_than_hours,
            dry_run,
        } => {
            let cutoff = SystemTime::now() - Duration::from_secs(older_than_hours * 3600);
            let mut entries = match tokio::fs::read_dir(scratch_dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    eprintln!("Cannot read {}: {}", scratch_dir.display(), e);
                    std::process::exit(1);
                }
            };

            let mut swept = 0usize;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                let modified = metadata.modified()?;
                if modified >= cutoff {
                    continue;
                }

                let path = entry.path();
                if *dry_run {
                    println!("Would delete {}", path.display());
                } else if metadata.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                    println!("Deleted {}", path.display());
                } else {
                    tokio::fs::remove_file(&path).await?;
                    println!("Deleted {}", path.display());
                }
                swept += 1;
            }

            if swept == 0 {
                println!("Nothing to sweep");
            } else if *dry_run {
                println!("{} stale entries (dry run)", swept);
            } else {
                println!("Swept {} stale entries", swept);
            }
        }
    }
    Ok(())
}
