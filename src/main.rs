use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpcore::{Config, IaStore, IaType, JsonFileStore, NoopDdns, Result, ServerContext};

#[derive(Parser)]
#[command(name = "dhcpcore")]
#[command(author, version, about = "DHCPv4/DHCPv6 lease engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build links and pools from the configuration and report their sizes.
    CheckConfig,
    ShowConfig,
    ListLeases,
    /// Run one expiry sweep against the leases file.
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::CheckConfig) {
        Commands::CheckConfig => {
            info!("Checking config: {:?}", cli.config);
            let store = Arc::new(JsonFileStore::open(&config.leases_file).await?);
            let context = ServerContext::build(config, store, Arc::new(NoopDdns), None).await?;

            println!(
                "{:<16} {:<6} {:<44} {:>12} {:>12}",
                "Link", "Type", "Pool", "Size", "Used"
            );
            println!("{}", "-".repeat(94));
            for link in context.links().links() {
                for ia_type in IaType::ALL {
                    for pool in link.pools(ia_type) {
                        println!(
                            "{:<16} {:<6} {:<44} {:>12} {:>12}",
                            link.name(),
                            ia_type.to_string(),
                            pool.to_string(),
                            pool.size(),
                            pool.used_count()
                        );
                    }
                }
            }
            println!("Configuration OK.");
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let store = JsonFileStore::open(&config.leases_file).await?;
            let ias = store.list_ias().await?;

            if ias.is_empty() {
                println!("No leases.");
                return Ok(());
            }

            println!(
                "{:<40} {:<42} {:<10} {:<24} {:<10}",
                "IA", "Address", "State", "Expires At", "Remaining"
            );
            println!("{}", "-".repeat(130));

            let now = Utc::now();
            for ia in ias {
                for record in &ia.addresses {
                    let address = match record.prefix_length {
                        Some(length) => format!("{}/{}", record.ip, length),
                        None => record.ip.to_string(),
                    };
                    let expires = record
                        .valid_end_time
                        .map(|end| end.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    let remaining = match record.valid_end_time {
                        Some(_) if record.is_expired(now) => "expired".to_string(),
                        Some(_) => format!("{}s", record.valid_lifetime(now)),
                        None => "-".to_string(),
                    };

                    println!(
                        "{:<40} {:<42} {:<10} {:<24} {:<10}",
                        ia.key.to_string(),
                        address,
                        record.state.to_string(),
                        expires,
                        remaining
                    );
                }
            }

            Ok(())
        }
        Commands::Reap => {
            let store = Arc::new(JsonFileStore::open(&config.leases_file).await?);
            let context = ServerContext::build(config, store, Arc::new(NoopDdns), None).await?;
            let count = context.reap_all().await?;
            println!("Expired {} lease(s).", count);
            Ok(())
        }
    }
}
