use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::allocator::AllocError;
use crate::config::NetConf;
use crate::eni::PoolError;
use crate::ip::IpError;
use crate::plugin::VpcNetPlugin;
use crate::routing::RoutingError;
use crate::store::StoreError;
use crate::types::{CmdArgs, ErrorResult, VersionResult};
use crate::wiring::WiringError;

/// CNI error code for an invalid network configuration
pub const CODE_INVALID_CONFIG: u32 = 7;
/// CNI error code asking the runtime to try again later
pub const CODE_TRY_AGAIN: u32 = 11;
pub const CODE_POOL_EXHAUSTED: u32 = 100;
pub const CODE_STORE: u32 = 101;
pub const CODE_WIRING: u32 = 102;
pub const CODE_ROUTING: u32 = 103;
pub const CODE_INTERNAL: u32 = 999;

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    // Get required environment variables
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // DEL may come without a namespace once the container is gone
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    // Get args (if any)
    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    // Read stdin data
    let mut stdin_data = Vec::new();
    io::stdin().read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Map a glog-style verbosity to a tracing level
pub fn verbosity_level(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Set up tracing on stderr; stdout is reserved for the CNI result.
/// `RUST_LOG` wins over the configured verbosity.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_level(verbosity).to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")
}

fn load(args: &CmdArgs) -> Result<NetConf> {
    let conf = NetConf::parse(&args.stdin_data)?;
    init_logging(conf.log_verbosity)?;
    Ok(conf)
}

/// Execute the add command
pub fn cmd_add() -> Result<()> {
    let args = parse_args()?;

    // Parse network configuration
    let conf = load(&args)?;

    let result = VpcNetPlugin::new(conf, args).add_network()?;

    // Output result as JSON
    result.print()?;

    Ok(())
}

/// Execute the delete command
pub fn cmd_del() -> Result<()> {
    let args = parse_args()?;
    let conf = load(&args)?;
    VpcNetPlugin::new(conf, args).del_network()
}

/// Execute the check command
pub fn cmd_check() -> Result<()> {
    let args = parse_args()?;
    let conf = load(&args)?;
    VpcNetPlugin::new(conf, args).check_network()
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    // Get command from environment
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    // Execute the appropriate command
    match cmd.as_str() {
        "ADD" => cmd_add(),
        "DEL" => cmd_del(),
        "CHECK" => cmd_check(),
        "VERSION" => {
            println!("{}", serde_json::to_string(&VersionResult::default())?);
            Ok(())
        }
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}

/// Pick the CNI error code for a failed command
pub fn error_code(err: &anyhow::Error) -> u32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<AllocError>() {
            return match e {
                AllocError::PoolExhausted { .. } => CODE_POOL_EXHAUSTED,
                AllocError::Store(store) => store_code(store),
            };
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return store_code(e);
        }
        if cause.is::<PoolError>() {
            return CODE_INVALID_CONFIG;
        }
        if cause.is::<WiringError>() || cause.is::<IpError>() {
            return CODE_WIRING;
        }
        if cause.is::<RoutingError>() {
            return CODE_ROUTING;
        }
        if cause.is::<serde_json::Error>() {
            return CODE_INVALID_CONFIG;
        }
    }
    CODE_INTERNAL
}

fn store_code(err: &StoreError) -> u32 {
    match err {
        StoreError::LockTimeout { .. } => CODE_TRY_AGAIN,
        _ => CODE_STORE,
    }
}

/// Build the CNI error document for a failed command
pub fn error_result(err: &anyhow::Error) -> ErrorResult {
    ErrorResult {
        cni_version: "1.0.0".to_string(),
        code: error_code(err),
        msg: err.to_string(),
        details: format!("{:#}", err),
    }
}
