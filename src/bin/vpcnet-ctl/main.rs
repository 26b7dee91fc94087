use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vpcnet::allocator::Allocator;
use vpcnet::config::{Config, InstallPaths, Installer, DEFAULT_CONFIG_PATH};
use vpcnet::eni::{EniPool, DEFAULT_ENI_MAP_PATH};
use vpcnet::ip::IpCommand;
use vpcnet::plugin::detach_record;
use vpcnet::store::{Store, DEFAULT_DATA_DIR};

/// Inspect and repair the VPC CNI allocation state on this host
#[derive(Parser)]
#[command(name = "vpcnet-ctl", author, version, about)]
struct Cli {
    /// Root of the allocation store
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Network name, as in the CNI configuration
    #[arg(long, default_value = "vpcnet")]
    network: String,

    /// Seconds to wait for the store lock
    #[arg(long, default_value_t = 10)]
    lock_timeout: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List outstanding allocations
    Allocations {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show per-ENI address usage
    Pool {
        /// ENI map written by the node agent
        #[arg(long, default_value = DEFAULT_ENI_MAP_PATH)]
        eni_map: PathBuf,
    },

    /// Force release of a container's address, its rules and its host veth
    Release {
        /// Container ID the address was allocated to
        #[arg(long)]
        container_id: String,
    },

    /// Write the CNI configuration list from the host configuration
    Install {
        /// Host configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// CNI config directory
        #[arg(long, default_value = "/etc/cni/net.d")]
        conf_dir: PathBuf,
    },
}

fn list_allocations(store: &Store, timeout: Duration, json: bool) -> Result<()> {
    let records = Allocator::new(store, timeout).allocations()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No allocations");
        return Ok(());
    }

    println!("Allocations:");
    for record in records {
        println!(
            "  {} {} on {} (host {}, container {}, since {})",
            record.container_id,
            record.address,
            record.eni_interface,
            record.host_ifname,
            record.container_ifname,
            record.created_at.to_rfc3339(),
        );
    }
    Ok(())
}

fn show_pool(store: &Store, timeout: Duration, eni_map: &Path) -> Result<()> {
    let pool = EniPool::load(eni_map).context("Error loading ENI configuration")?;
    let records = Allocator::new(store, timeout).allocations()?;
    let in_use: HashSet<Ipv4Addr> = records.iter().map(|r| r.address).collect();

    println!("ENI pool ({} addresses):", pool.capacity());
    for eni in pool.enis() {
        let (used, free): (Vec<Ipv4Addr>, Vec<Ipv4Addr>) =
            eni.addresses().iter().copied().partition(|a| in_use.contains(a));
        println!(
            "  {} [{} {}] {} via {}, primary {}: {} total, {} used, {} free",
            eni.interface_name(),
            eni.eni_id(),
            eni.mac_address().unwrap_or("-"),
            eni.subnet(),
            eni.gateway(),
            eni.primary_address().map_or_else(|| "-".to_string(), |a| a.to_string()),
            eni.addresses().len(),
            used.len(),
            free.len(),
        );
        if !free.is_empty() {
            println!("    free: {}", free.iter().join(", "));
        }
    }

    for orphan in records.iter().filter(|r| pool.owner_of(r.address).is_none()) {
        warn!(
            container_id = %orphan.container_id,
            address = %orphan.address,
            "allocation refers to an address no longer in the ENI map"
        );
    }
    Ok(())
}

fn force_release(store: &Store, timeout: Duration, container_id: &str) -> Result<()> {
    let alloc = Allocator::new(store, timeout);
    let Some(record) = alloc.lookup(container_id)? else {
        println!("No allocation for container {}", container_id);
        return Ok(());
    };

    detach_record(&IpCommand, &alloc, &record, PathBuf::new())?;
    println!("Released {} from container {}", record.address, container_id);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let timeout = Duration::from_secs(cli.lock_timeout);

    match cli.command {
        Commands::Allocations { json } => {
            let store = Store::open(&cli.data_dir, &cli.network)?;
            list_allocations(&store, timeout, json)?;
        }

        Commands::Pool { eni_map } => {
            let store = Store::open(&cli.data_dir, &cli.network)?;
            show_pool(&store, timeout, &eni_map)?;
        }

        Commands::Release { container_id } => {
            let store = Store::open(&cli.data_dir, &cli.network)?;
            force_release(&store, timeout, &container_id)?;
        }

        Commands::Install { config, conf_dir } => {
            let config = Config::load(&config)?;
            let installer = Installer::new(InstallPaths {
                cni_conf_dir: conf_dir,
                state_dir: cli.data_dir,
            });
            let path = installer.install(&cli.network, &config)?;
            println!("Network configuration written to {}", path.display());
        }
    }

    Ok(())
}
