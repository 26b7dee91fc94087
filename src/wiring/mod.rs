//! veth wiring between the host and a container network namespace.
//!
//! Container side: the pod address as a /32, a link-scope route to a fixed
//! link-local next hop, a permanent neighbour entry for that next hop
//! pointing at the host end, and a default route via it. Host side: the
//! link is brought up and a /32 route sends traffic for the pod down the
//! veth. The pod address itself is never assigned on the host.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocator::temp_peer_ifname;
use crate::ip::{link_mac, IpError, IpRunner};
use crate::types::Interface;

/// Next hop every container routes through
pub const CONTAINER_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("network namespace {path} is unreachable")]
    NamespaceUnreachable {
        path: PathBuf,
        #[source]
        source: IpError,
    },

    #[error("failed to create link {ifname}")]
    LinkCreateFailed {
        ifname: String,
        #[source]
        source: IpError,
    },

    #[error("failed to configure {address} on {ifname}")]
    AddressAssignFailed {
        address: Ipv4Addr,
        ifname: String,
        #[source]
        source: IpError,
    },

    #[error("failed to remove link {ifname}")]
    LinkRemoveFailed {
        ifname: String,
        #[source]
        source: IpError,
    },
}

/// Names and namespace of one veth pair. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDescriptor {
    pub container_id: String,
    pub host_ifname: String,
    pub container_ifname: String,
    pub netns: PathBuf,
}

/// Creates and removes veth pairs.
pub struct Vether<R> {
    ip: R,
    mtu: Option<u32>,
}

impl<R: IpRunner> Vether<R> {
    pub fn new(ip: R, mtu: Option<u32>) -> Self {
        Self { ip, mtu }
    }

    /// Build the veth pair for `link` and configure `address` inside the
    /// container. Returns the host and container interfaces.
    ///
    /// A pair left behind by an earlier attempt for the same container is
    /// removed first, so a retried attach rebuilds from scratch.
    pub fn setup(
        &self,
        address: Ipv4Addr,
        link: &LinkDescriptor,
    ) -> Result<(Interface, Interface), WiringError> {
        let netns = link.netns.as_path();
        let host = link.host_ifname.as_str();
        let peer = temp_peer_ifname(&link.container_id);
        let ifname = link.container_ifname.as_str();

        // Fail before touching the host if the namespace is already gone.
        self.ip
            .run(Some(netns), &["link", "show", "lo"])
            .map_err(|source| self.namespace_error(netns, source))?;

        self.remove_link(host)?;
        self.remove_link(&peer)?;

        let create = |source| WiringError::LinkCreateFailed {
            ifname: host.to_string(),
            source,
        };

        let mtu = self.mtu.map(|m| m.to_string());
        let mut add = vec!["link", "add", host];
        if let Some(mtu) = &mtu {
            add.extend(["mtu", mtu.as_str()]);
        }
        add.extend(["type", "veth", "peer", "name", peer.as_str()]);
        if let Some(mtu) = &mtu {
            add.extend(["mtu", mtu.as_str()]);
        }
        self.ip.run(None, &add).map_err(create)?;

        let host_mac = link_mac(&self.ip, None, host).map_err(create)?;

        let netns_arg = netns.to_string_lossy();
        self.ip
            .run(None, &["link", "set", &peer, "netns", &netns_arg])
            .map_err(create)?;

        // Container side
        let in_container = |args: &[&str]| self.ip.run(Some(netns), args);
        let inner = |source| WiringError::LinkCreateFailed {
            ifname: ifname.to_string(),
            source,
        };
        let assign = |source| WiringError::AddressAssignFailed {
            address,
            ifname: ifname.to_string(),
            source,
        };

        in_container(&["link", "set", &peer, "name", ifname]).map_err(inner)?;
        in_container(&["link", "set", ifname, "up"]).map_err(inner)?;

        let cidr = format!("{}/32", address);
        let gateway = CONTAINER_GATEWAY.to_string();
        in_container(&["addr", "add", &cidr, "dev", ifname]).map_err(assign)?;
        in_container(&["route", "replace", &gateway, "dev", ifname, "scope", "link"])
            .map_err(assign)?;
        in_container(&[
            "neigh", "replace", &gateway, "lladdr", &host_mac, "dev", ifname, "nud", "permanent",
        ])
        .map_err(assign)?;
        in_container(&["route", "replace", "default", "via", &gateway, "dev", ifname])
            .map_err(assign)?;

        let container_mac = link_mac(&self.ip, Some(netns), ifname).map_err(inner)?;

        // Host side
        self.ip.run(None, &["link", "set", host, "up"]).map_err(create)?;
        self.ip
            .run(None, &["route", "replace", &cidr, "dev", host, "scope", "link"])
            .map_err(|source| WiringError::AddressAssignFailed {
                address,
                ifname: host.to_string(),
                source,
            })?;

        info!(
            container_id = %link.container_id,
            host = host,
            container = ifname,
            %address,
            "veth pair ready"
        );

        Ok((
            Interface {
                name: host.to_string(),
                mac: Some(host_mac),
                sandbox: None,
            },
            Interface {
                name: ifname.to_string(),
                mac: Some(container_mac),
                sandbox: Some(netns.to_string_lossy().into_owned()),
            },
        ))
    }

    /// Remove the veth pair by deleting its host end.
    ///
    /// Succeeds when the link is already gone: once the container namespace
    /// is destroyed the kernel removes both ends.
    pub fn teardown(&self, link: &LinkDescriptor) -> Result<(), WiringError> {
        self.remove_link(&link.host_ifname)?;
        self.remove_link(&temp_peer_ifname(&link.container_id))?;
        debug!(container_id = %link.container_id, host = %link.host_ifname, "veth pair removed");
        Ok(())
    }

    fn remove_link(&self, ifname: &str) -> Result<(), WiringError> {
        match self.ip.run(None, &["link", "del", ifname]) {
            Ok(_) => {
                debug!(ifname, "deleted link");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => {
                warn!(ifname, error = %source, "failed to delete link");
                Err(WiringError::LinkRemoveFailed {
                    ifname: ifname.to_string(),
                    source,
                })
            }
        }
    }

    fn namespace_error(&self, netns: &Path, source: IpError) -> WiringError {
        WiringError::NamespaceUnreachable {
            path: netns.to_path_buf(),
            source,
        }
    }
}
