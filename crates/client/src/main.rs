use std::time::Duration;

use clap::{Parser, Subcommand};
use common::catalog::DEFAULT_CATALOG_URL;
use common::labels::split_tags;
use common::metadata::DEFAULT_METADATA_URL;
use common::{derive_ids, derive_records, CatalogClient, DerivationSettings, MetadataClient};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Catalog agent base URL
    #[arg(long, env = "CONSUL_ADDR", default_value = DEFAULT_CATALOG_URL, global = true)]
    consul_addr: String,

    /// Catalog access token
    #[arg(long, env = "CONSUL_TOKEN", global = true)]
    consul_token: Option<String>,

    /// Metadata service base URL
    #[arg(long, env = "METADATA_URL", default_value = DEFAULT_METADATA_URL, global = true)]
    metadata_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalog entries owned by this host
    List {
        /// Include entries of every host and producer
        #[arg(long)]
        all: bool,
    },
    /// Show the records a container would register, without registering
    Preview {
        /// Container name (case-insensitive)
        container: String,

        #[arg(long, env = "SVC_PREFIX", default_value = "")]
        prefix: String,

        #[arg(long, env = "SERVICE_TAGS", default_value = "")]
        service_tags: String,

        #[arg(long)]
        ignore_nameless: bool,
    },
    /// Deregister one catalog entry
    Deregister {
        id: String,
    },
    /// Deregister every entry a container's port mappings map to
    DeregisterContainer {
        /// Container name (case-insensitive)
        container: String,
    },
    /// Deregister every entry owned by this host
    Purge,
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let catalog = CatalogClient::new(&cli.consul_addr, cli.consul_token.clone(), TIMEOUT)?;
    let metadata = MetadataClient::new(&cli.metadata_url, TIMEOUT)?;

    match cli.command {
        Commands::List { all } => {
            let entries = if all {
                catalog.list_all().await?
            } else {
                let host = metadata.host_identity().await?;
                catalog.list_host(&host.uuid).await?
            };
            println!("Catalog entries:");
            for entry in entries {
                let owner = entry
                    .owner
                    .map(|o| format!("{}/{}", o.host_uuid, o.container_id))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "ID: {}, Service: {}, Port: {}, Owner: {}",
                    entry.service.id, entry.service.service, entry.service.port, owner
                );
            }
        }
        Commands::Preview {
            container,
            prefix,
            service_tags,
            ignore_nameless,
        } => {
            let host = metadata.host_identity().await?;
            let Some(observation) = metadata.container_by_name(&host, &container).await? else {
                eprintln!("No container named {} on this host", container);
                std::process::exit(1);
            };
            let settings = DerivationSettings {
                prefix,
                base_tags: split_tags(&service_tags),
                ignore_unnamed: ignore_nameless,
            };
            match derive_records(&host, &observation, &settings) {
                Ok(records) => println!("{}", serde_json::to_string_pretty(&records)?),
                Err(skip) => {
                    eprintln!("{}", skip);
                    std::process::exit(1);
                }
            }
        }
        Commands::Deregister { id } => {
            if catalog.deregister(&id).await {
                println!("Deregistered: {}", id);
            } else {
                eprintln!("Failed to deregister: {}", id);
                std::process::exit(1);
            }
        }
        Commands::DeregisterContainer { container } => {
            let host = metadata.host_identity().await?;
            let Some(observation) = metadata.container_by_name(&host, &container).await? else {
                eprintln!("No container named {} on this host", container);
                std::process::exit(1);
            };
            let ids = match derive_ids(&host, &observation) {
                Ok(ids) => ids,
                Err(skip) => {
                    eprintln!("{}", skip);
                    std::process::exit(1);
                }
            };
            let outcomes = catalog.deregister_all(ids).await;
            let failed = outcomes.iter().filter(|o| !o.ok).count();
            for outcome in outcomes {
                println!("{}", outcome);
            }
            if failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Purge => {
            let host = metadata.host_identity().await?;
            let entries = catalog.list_host(&host.uuid).await?;
            let outcomes = catalog
                .deregister_all(entries.into_iter().map(|e| e.service.id))
                .await;
            let failed = outcomes.iter().filter(|o| !o.ok).count();
            for outcome in outcomes {
                println!("{}", outcome);
            }
            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
