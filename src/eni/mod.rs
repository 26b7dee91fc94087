//! Read-only view of the ENIs attached to this host.
//!
//! The map is written by the node agent that reconciles with the cloud
//! provider. The plugin re-reads it on every invocation and never writes it.

use ipnetwork::Ipv4Network;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::routing::{RouteTable, ENI_TABLE_BASE, MAX_TABLE_ID};

/// Default location of the ENI map written by the node agent
pub const DEFAULT_ENI_MAP_PATH: &str = "/var/lib/vpcnet/eni_map.json";

/// Errors raised while loading the ENI map
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to read ENI map {path}")]
    MapUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed ENI map: {0}")]
    MapMalformed(String),

    #[error("address {address} is listed on both {first} and {second}")]
    DuplicateAddress {
        address: Ipv4Addr,
        first: String,
        second: String,
    },
}

/// One entry of the ENI map as written by the node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EniEntry {
    pub eni_id: String,
    #[serde(default)]
    pub interface_name: String,
    pub attachment_index: u32,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub subnet: Option<Ipv4Network>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub interface_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub ips: Vec<Ipv4Addr>,
}

/// A validated elastic network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eni {
    eni_id: String,
    interface_name: String,
    attachment_index: u32,
    /// Lower case, colon separated
    mac_address: Option<String>,
    subnet: Ipv4Network,
    gateway: Ipv4Addr,
    primary_address: Option<Ipv4Addr>,
    /// Sorted ascending.
    addresses: Vec<Ipv4Addr>,
}

impl Eni {
    pub fn eni_id(&self) -> &str {
        &self.eni_id
    }

    /// Host interface the ENI shows up as
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn attachment_index(&self) -> u32 {
        self.attachment_index
    }

    pub fn mac_address(&self) -> Option<&str> {
        self.mac_address.as_deref()
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// The ENI's own address, never handed to pods
    pub fn primary_address(&self) -> Option<Ipv4Addr> {
        self.primary_address
    }

    /// Secondary addresses available for pods, in allocation order
    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    fn from_entry(entry: EniEntry) -> Result<Self, PoolError> {
        let name = entry.interface_name.trim();
        if name.is_empty() {
            return Err(PoolError::MapMalformed(format!(
                "ENI {} has no interface name",
                entry.eni_id
            )));
        }
        if name.len() >= libc::IFNAMSIZ || name.contains(|c: char| c == '/' || c.is_whitespace()) {
            return Err(PoolError::MapMalformed(format!(
                "ENI {} has an unusable interface name {:?}",
                entry.eni_id, name
            )));
        }

        if RouteTable::for_attachment(entry.attachment_index).is_err() {
            return Err(PoolError::MapMalformed(format!(
                "ENI {} ({}) has attachment index {}, the highest usable is {}",
                entry.eni_id,
                name,
                entry.attachment_index,
                MAX_TABLE_ID - ENI_TABLE_BASE
            )));
        }

        let mac_address = entry
            .mac_address
            .as_deref()
            .map(|mac| {
                normalize_mac(mac).ok_or_else(|| {
                    PoolError::MapMalformed(format!(
                        "ENI {} has an invalid MAC address {:?}",
                        entry.eni_id, mac
                    ))
                })
            })
            .transpose()?;

        let subnet = entry.subnet.ok_or_else(|| {
            PoolError::MapMalformed(format!("ENI {} ({}) has no subnet", entry.eni_id, name))
        })?;

        // The VPC router always sits on the first host address of the subnet.
        let gateway = match entry.gateway {
            Some(gw) => gw,
            None if subnet.prefix() < 31 => Ipv4Addr::from(u32::from(subnet.network()) + 1),
            None => {
                return Err(PoolError::MapMalformed(format!(
                    "subnet {} of ENI {} has no room for a gateway",
                    subnet, entry.eni_id
                )))
            }
        };

        if let Some(outside) = entry.ips.iter().find(|ip| !subnet.contains(**ip)) {
            return Err(PoolError::MapMalformed(format!(
                "address {} of ENI {} is outside subnet {}",
                outside, entry.eni_id, subnet
            )));
        }

        if let Some(primary) = entry.interface_ip {
            if !subnet.contains(primary) || entry.ips.contains(&primary) {
                return Err(PoolError::MapMalformed(format!(
                    "primary address {} of ENI {} must be inside {} and not a pod address",
                    primary, entry.eni_id, subnet
                )));
            }
        }

        if let Some(dup) = entry.ips.iter().duplicates().next() {
            return Err(PoolError::DuplicateAddress {
                address: *dup,
                first: name.to_string(),
                second: name.to_string(),
            });
        }

        let mut addresses = entry.ips;
        addresses.sort();

        Ok(Self {
            eni_id: entry.eni_id,
            interface_name: name.to_string(),
            attachment_index: entry.attachment_index,
            mac_address,
            subnet,
            gateway,
            primary_address: entry.interface_ip,
            addresses,
        })
    }
}

fn normalize_mac(mac: &str) -> Option<String> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then(|| mac.to_ascii_lowercase())
}

/// Every ENI on the host, ordered by attachment index.
#[derive(Debug, Clone, Default)]
pub struct EniPool {
    enis: Vec<Eni>,
}

impl EniPool {
    /// Load and validate the ENI map at `path`
    pub fn load(path: &Path) -> Result<Self, PoolError> {
        let data = fs::read(path).map_err(|source| PoolError::MapUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let entries: Vec<EniEntry> = serde_json::from_slice(&data)
            .map_err(|e| PoolError::MapMalformed(format!("{}: {}", path.display(), e)))?;

        Self::from_entries(entries)
    }

    /// Validate already-decoded map entries
    pub fn from_entries(entries: Vec<EniEntry>) -> Result<Self, PoolError> {
        let mut enis = entries
            .into_iter()
            .map(Eni::from_entry)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(name) = enis.iter().map(|e| &e.interface_name).duplicates().next() {
            return Err(PoolError::MapMalformed(format!(
                "interface {} is listed more than once",
                name
            )));
        }
        if let Some(index) = enis.iter().map(|e| e.attachment_index).duplicates().next() {
            return Err(PoolError::MapMalformed(format!(
                "attachment index {} is listed more than once",
                index
            )));
        }

        enis.sort_by_key(|e| e.attachment_index);

        // Address pools must be disjoint across ENIs.
        let mut owners: HashMap<Ipv4Addr, &str> = HashMap::new();
        for eni in &enis {
            for address in &eni.addresses {
                if let Some(first) = owners.insert(*address, &eni.interface_name) {
                    return Err(PoolError::DuplicateAddress {
                        address: *address,
                        first: first.to_string(),
                        second: eni.interface_name.clone(),
                    });
                }
            }
        }

        Ok(Self { enis })
    }

    /// ENIs in allocation order
    pub fn enis(&self) -> &[Eni] {
        &self.enis
    }

    /// Look up an ENI by host interface name
    pub fn find(&self, interface_name: &str) -> Option<&Eni> {
        self.enis.iter().find(|e| e.interface_name == interface_name)
    }

    /// The ENI whose pool contains `address`
    pub fn owner_of(&self, address: Ipv4Addr) -> Option<&Eni> {
        self.enis
            .iter()
            .find(|e| e.addresses.binary_search(&address).is_ok())
    }

    /// Number of allocatable addresses across all ENIs
    pub fn capacity(&self) -> usize {
        self.enis.iter().map(|e| e.addresses.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.enis.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(name: &str, index: u32, subnet: &str, ips: &[&str]) -> EniEntry {
        EniEntry {
            eni_id: format!("eni-{}", name),
            interface_name: name.to_string(),
            attachment_index: index,
            mac_address: None,
            subnet: Some(subnet.parse().unwrap()),
            gateway: None,
            interface_ip: None,
            ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn orders_enis_and_addresses() {
        let pool = EniPool::from_entries(vec![
            entry("eth2", 2, "10.0.2.0/24", &["10.0.2.9"]),
            entry("eth1", 1, "10.0.1.0/24", &["10.0.1.6", "10.0.1.5"]),
        ])
        .unwrap();

        let names: Vec<_> = pool.enis().iter().map(|e| e.interface_name()).collect();
        assert_eq!(names, ["eth1", "eth2"]);
        assert_eq!(
            pool.enis()[0].addresses(),
            &["10.0.1.5".parse::<Ipv4Addr>().unwrap(), "10.0.1.6".parse().unwrap()]
        );
        assert_eq!(pool.enis()[0].gateway(), "10.0.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(pool.capacity(), 3);
        assert_eq!(
            pool.owner_of("10.0.2.9".parse().unwrap()).map(|e| e.interface_name()),
            Some("eth2")
        );
    }

    #[test]
    fn rejects_address_on_two_enis() {
        let mut second = entry("eth2", 2, "10.0.0.0/16", &["10.0.1.5"]);
        second.gateway = Some("10.0.0.1".parse().unwrap());
        let err = EniPool::from_entries(vec![
            entry("eth1", 1, "10.0.1.0/24", &["10.0.1.5"]),
            second,
        ])
        .unwrap_err();

        match err {
            PoolError::DuplicateAddress { address, first, second } => {
                assert_eq!(address, "10.0.1.5".parse::<Ipv4Addr>().unwrap());
                assert_eq!(first, "eth1");
                assert_eq!(second, "eth2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_missing_name_or_subnet() {
        let mut nameless = entry("eth1", 1, "10.0.1.0/24", &[]);
        nameless.interface_name = String::new();
        assert!(matches!(
            EniPool::from_entries(vec![nameless]),
            Err(PoolError::MapMalformed(_))
        ));

        let mut no_subnet = entry("eth1", 1, "10.0.1.0/24", &[]);
        no_subnet.subnet = None;
        assert!(matches!(
            EniPool::from_entries(vec![no_subnet]),
            Err(PoolError::MapMalformed(_))
        ));
    }

    #[test]
    fn rejects_address_outside_subnet() {
        assert!(matches!(
            EniPool::from_entries(vec![entry("eth1", 1, "10.0.1.0/24", &["10.0.9.5"])]),
            Err(PoolError::MapMalformed(_))
        ));
    }

    #[test]
    fn rejects_repeated_attachment_index() {
        assert!(matches!(
            EniPool::from_entries(vec![
                entry("eth1", 1, "10.0.1.0/24", &[]),
                entry("eth2", 1, "10.0.2.0/24", &[]),
            ]),
            Err(PoolError::MapMalformed(_))
        ));
    }

    #[test]
    fn rejects_attachment_index_without_route_table() {
        let last = MAX_TABLE_ID - ENI_TABLE_BASE;
        let pool = EniPool::from_entries(vec![entry("eth9", last, "10.0.9.0/24", &["10.0.9.5"])])
            .unwrap();
        assert_eq!(pool.enis()[0].attachment_index(), 152);

        for index in [last + 1, 200, u32::MAX] {
            assert!(matches!(
                EniPool::from_entries(vec![entry("eth9", index, "10.0.9.0/24", &["10.0.9.5"])]),
                Err(PoolError::MapMalformed(msg)) if msg.contains("attachment index")
            ));
        }
    }

    #[test]
    fn validates_mac_and_primary_address() {
        let mut eni = entry("eth1", 1, "10.0.1.0/24", &["10.0.1.5"]);
        eni.mac_address = Some("0A:1B:2C:3D:4E:5F".to_string());
        eni.interface_ip = Some("10.0.1.4".parse().unwrap());
        let pool = EniPool::from_entries(vec![eni.clone()]).unwrap();
        assert_eq!(pool.enis()[0].mac_address(), Some("0a:1b:2c:3d:4e:5f"));
        assert_eq!(
            pool.enis()[0].primary_address(),
            Some("10.0.1.4".parse::<Ipv4Addr>().unwrap())
        );

        let mut bad_mac = eni.clone();
        bad_mac.mac_address = Some("0a:1b:2c:3d:4e".to_string());
        assert!(matches!(
            EniPool::from_entries(vec![bad_mac]),
            Err(PoolError::MapMalformed(_))
        ));

        let mut primary_as_pod = eni.clone();
        primary_as_pod.interface_ip = Some("10.0.1.5".parse().unwrap());
        assert!(matches!(
            EniPool::from_entries(vec![primary_as_pod]),
            Err(PoolError::MapMalformed(_))
        ));

        let mut primary_outside = eni;
        primary_outside.interface_ip = Some("10.0.2.4".parse().unwrap());
        assert!(matches!(
            EniPool::from_entries(vec![primary_outside]),
            Err(PoolError::MapMalformed(_))
        ));
    }

    #[test]
    fn load_reports_unreadable_and_malformed_maps() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            EniPool::load(&missing),
            Err(PoolError::MapUnreadable { .. })
        ));

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, b"{not json").unwrap();
        assert!(matches!(
            EniPool::load(&garbage),
            Err(PoolError::MapMalformed(_))
        ));

        let good = dir.path().join("eni_map.json");
        let mut file = fs::File::create(&good).unwrap();
        file.write_all(
            br#"[{"eni_id":"eni-0a1","interface_name":"eth1","attachment_index":1,
                 "subnet":"10.0.1.0/24","gateway":"10.0.1.1","ips":["10.0.1.5"]}]"#,
        )
        .unwrap();
        let pool = EniPool::load(&good).unwrap();
        assert_eq!(pool.find("eth1").map(|e| e.eni_id()), Some("eni-0a1"));
    }
}
