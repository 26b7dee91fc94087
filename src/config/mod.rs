use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::allocator::DEFAULT_LOCK_TIMEOUT;
use crate::eni::DEFAULT_ENI_MAP_PATH;
use crate::store::DEFAULT_DATA_DIR;

/// Default location of the host configuration
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpcnet/config.toml";

/// Name of the conflist written by the installer
pub const CONFLIST_NAME: &str = "10-vpcnet.conflist";

/// Network configuration handed to the plugin on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Where allocation records live
    #[serde(rename = "dataDir", default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// ENI map written by the node agent
    #[serde(rename = "eniMapPath", default, skip_serializing_if = "Option::is_none")]
    pub eni_map_path: Option<PathBuf>,
    /// glog-style verbosity
    #[serde(rename = "logVerbosity", default)]
    pub log_verbosity: u8,
    /// Longest wait for the store lock
    #[serde(rename = "lockTimeoutSecs", default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_secs: Option<u64>,
    /// veth MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .context("Failed to parse network configuration")?;

        // Validation
        if conf.name.is_empty() {
            anyhow::bail!("Network name is required");
        }

        if conf.name.contains('/') || conf.name.starts_with('.') {
            anyhow::bail!("Network name {:?} cannot be used as a directory name", conf.name);
        }

        if let Some(mtu) = conf.mtu {
            if !(68..=65535).contains(&mtu) {
                anyhow::bail!("Invalid MTU {} (must be between 68 and 65535)", mtu);
            }
        }

        Ok(conf)
    }

    /// Create a default configuration for a network
    pub fn new_default(name: &str, log_verbosity: u8) -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            name: name.to_string(),
            plugin_type: "vpcnet".to_string(),
            data_dir: None,
            eni_map_path: None,
            log_verbosity,
            lock_timeout_secs: None,
            mtu: None,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn eni_map_path(&self) -> PathBuf {
        self.eni_map_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENI_MAP_PATH))
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Host configuration shared by the node agent and the plugin installer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Network topology of the cluster
    #[serde(default)]
    pub network: Option<Network>,
    /// Logging configuration
    #[serde(default)]
    pub logging: Option<Logging>,
}

/// Network topology related configuration for the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    /// CIDR pods run in
    pub cluster_cidr: Option<Ipv4Network>,
    /// CIDR of cluster services
    pub service_cidr: Option<Ipv4Network>,
    /// Masquerade external pod traffic from the host's main interface
    #[serde(default)]
    pub pod_ip_masq: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Logging {
    /// Verbosity of the CNI plugin
    #[serde(default)]
    pub cni_v_level: u8,
}

impl Config {
    /// Load the configuration from disk
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).with_context(|| {
            format!("Failed to load configuration file {}", path.display())
        })?;

        let config: Config = toml::from_str(&data)
            .with_context(|| format!("Failed to decode configuration file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(Network {
            cluster_cidr: Some(cluster),
            service_cidr: Some(service),
            ..
        }) = &self.network
        {
            if cluster.overlaps(*service) {
                anyhow::bail!(
                    "cluster CIDR {} overlaps service CIDR {}",
                    cluster,
                    service
                );
            }
        }
        Ok(())
    }

    pub fn cni_v_level(&self) -> u8 {
        self.logging.as_ref().map_or(0, |l| l.cni_v_level)
    }
}

/// A CNI network configuration list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfList {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub plugins: Vec<NetConf>,
}

/// Where the installer puts things
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallPaths {
    /// Path to the CNI config directory
    pub cni_conf_dir: PathBuf,
    /// Path to store allocation state
    pub state_dir: PathBuf,
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self {
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            state_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

/// Installer for the VPC CNI plugin configuration
pub struct Installer {
    paths: InstallPaths,
}

impl Installer {
    /// Create a new installer
    pub fn new(paths: InstallPaths) -> Self {
        Self { paths }
    }

    /// Render the conflist for `network` from the host configuration
    pub fn conflist(&self, network: &str, config: &Config) -> NetConfList {
        let mut conf = NetConf::new_default(network, config.cni_v_level());
        if self.paths.state_dir != Path::new(DEFAULT_DATA_DIR) {
            conf.data_dir = Some(self.paths.state_dir.clone());
        }

        NetConfList {
            cni_version: conf.cni_version.clone(),
            name: network.to_string(),
            plugins: vec![conf],
        }
    }

    /// Write the conflist and create the state directory; returns the
    /// path of the written conflist
    pub fn install(&self, network: &str, config: &Config) -> Result<PathBuf> {
        for dir in [&self.paths.cni_conf_dir, &self.paths.state_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let config_path = self.paths.cni_conf_dir.join(CONFLIST_NAME);
        let json = serde_json::to_string_pretty(&self.conflist(network, config))?;
        fs::write(&config_path, json)
            .with_context(|| format!("Failed to write CNI config to {}", config_path.display()))?;

        info!(path = %config_path.display(), "wrote CNI configuration");
        Ok(config_path)
    }
}
