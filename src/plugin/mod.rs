use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::allocator::{host_ifname, Allocation, Allocator};
use crate::config::NetConf;
use crate::eni::EniPool;
use crate::ip::{link_is_up, link_mac, IpCommand, IpRunner};
use crate::routing::{PolicyRouter, RouteTable};
use crate::store::{AllocationRecord, Store};
use crate::types::{CmdArgs, IPConfig, Result as CniResult, Route as CniRoute};
use crate::wiring::{LinkDescriptor, Vether, CONTAINER_GATEWAY};

/// Remove the rules and host veth of `record`, then release it.
///
/// Rules are skipped when the record's attachment index has no route table,
/// since none can have been installed; the address is still released.
pub fn detach_record<R: IpRunner>(
    ip: &R,
    alloc: &Allocator<'_>,
    record: &AllocationRecord,
    netns: PathBuf,
) -> Result<()> {
    let container_id = record.container_id.as_str();

    match RouteTable::for_attachment(record.eni_index) {
        Ok(table) => PolicyRouter::new(ip)
            .remove(record.address, table)
            .with_context(|| format!("Error removing routing for container {}", container_id))?,
        Err(e) => warn!(container_id, error = %e, "skipping rule removal"),
    }

    let link = LinkDescriptor {
        container_id: container_id.to_string(),
        host_ifname: record.host_ifname.clone(),
        container_ifname: record.container_ifname.clone(),
        netns,
    };
    Vether::new(ip, None)
        .teardown(&link)
        .with_context(|| format!("Error removing interfaces for container {}", container_id))?;

    alloc
        .release(container_id)
        .with_context(|| format!("Error releasing IP address for container {}", container_id))?;

    info!(container_id, address = %record.address, "container detached");
    Ok(())
}

/// VPC plugin implementation
pub struct VpcNetPlugin<R = IpCommand> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    ip: R,
}

impl VpcNetPlugin<IpCommand> {
    /// Create a new plugin driving the real `ip` tool
    pub fn new(config: NetConf, args: CmdArgs) -> Self {
        Self::with_runner(config, args, IpCommand)
    }
}

impl<R: IpRunner> VpcNetPlugin<R> {
    pub fn with_runner(config: NetConf, args: CmdArgs, ip: R) -> Self {
        Self { config, args, ip }
    }

    /// Attach the container: allocate, wire, route.
    ///
    /// Once the record is committed, any wiring or routing failure rolls the
    /// attach back (rules, veth, then the record if this attach created it)
    /// before returning the error, so the address goes back to the pool
    /// straight away. A retry that has meanwhile claimed the record is left
    /// alone.
    pub fn add_network(&self) -> Result<CniResult> {
        let container_id = self.args.container_id.as_str();
        let netns = self.args.netns_path().with_context(|| {
            format!("No network namespace given for container {}", container_id)
        })?;
        if self.args.ifname.is_empty() || self.args.ifname.len() >= libc::IFNAMSIZ {
            anyhow::bail!("Invalid container interface name {:?}", self.args.ifname);
        }

        let map_path = self.config.eni_map_path();
        let pool = EniPool::load(&map_path).context("Error loading ENI configuration")?;
        let store = self.open_store()?;
        let alloc = Allocator::new(&store, self.config.lock_timeout());

        let claim = alloc
            .allocate(&pool, container_id, &self.args.ifname)
            .with_context(|| format!("Error allocating IP address for container {}", container_id))?;
        let record = &claim.record;

        info!(
            address = %record.address,
            eni = %record.eni_interface,
            container_id,
            netns = %netns.display(),
            "allocated IP for container"
        );

        let link = LinkDescriptor {
            container_id: container_id.to_string(),
            host_ifname: record.host_ifname.clone(),
            container_ifname: record.container_ifname.clone(),
            netns,
        };

        match self.wire(&pool, record, &link) {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(
                    container_id,
                    error = %format!("{:#}", err),
                    "attach failed after allocation, rolling back"
                );
                self.rollback(&alloc, &claim, &link);
                Err(err)
            }
        }
    }

    /// Detach the container: unroute, unwire, release.
    ///
    /// Always safe to call, including for containers that never attached.
    pub fn del_network(&self) -> Result<()> {
        let container_id = self.args.container_id.as_str();
        let store = self.open_store()?;
        let alloc = Allocator::new(&store, self.config.lock_timeout());

        let Some(record) = alloc
            .lookup(container_id)
            .with_context(|| format!("Error looking up allocation for container {}", container_id))?
        else {
            info!(container_id, "no allocation for container, nothing to release");
            // Clean up a veth left by an attach that died before committing.
            let link = self.link_for(container_id, &host_ifname(container_id));
            if let Err(e) = Vether::new(&self.ip, self.config.mtu).teardown(&link) {
                warn!(container_id, error = %e, "failed to remove leftover veth");
            }
            return Ok(());
        };

        detach_record(&self.ip, &alloc, &record, self.args.netns_path().unwrap_or_default())
    }

    /// Check that an attached container is still wired as recorded
    pub fn check_network(&self) -> Result<()> {
        let container_id = self.args.container_id.as_str();
        let store = self.open_store()?;
        let record = Allocator::new(&store, self.config.lock_timeout())
            .lookup(container_id)?
            .with_context(|| format!("No allocation recorded for container {}", container_id))?;

        let netns = self.args.netns_path().with_context(|| {
            format!("No network namespace given for container {}", container_id)
        })?;

        if !link_is_up(&self.ip, Some(&netns), &record.container_ifname)? {
            anyhow::bail!(
                "Interface {} is not UP in container {}",
                record.container_ifname,
                container_id
            );
        }

        let pool = EniPool::load(&self.config.eni_map_path())
            .context("Error loading ENI configuration")?;
        let eni = pool.find(&record.eni_interface).with_context(|| {
            format!(
                "ENI {} holding {} is no longer in the ENI map",
                record.eni_interface, record.address
            )
        })?;
        if let Some(expected) = eni.mac_address() {
            let actual = link_mac(&self.ip, None, eni.interface_name())?;
            if !actual.eq_ignore_ascii_case(expected) {
                anyhow::bail!(
                    "Interface {} has MAC {}, but ENI {} is {}",
                    eni.interface_name(),
                    actual,
                    eni.eni_id(),
                    expected
                );
            }
        }

        let table = RouteTable::for_attachment(record.eni_index)?;
        if !PolicyRouter::new(&self.ip).is_installed(record.address, table)? {
            anyhow::bail!(
                "No source rule for {} (table {}) for container {}",
                record.address,
                table,
                container_id
            );
        }

        Ok(())
    }

    fn open_store(&self) -> Result<Store> {
        let data_dir = self.config.data_dir();
        Store::open(&data_dir, &self.config.name)
            .with_context(|| format!("Error opening allocation store in {}", data_dir.display()))
    }

    fn link_for(&self, container_id: &str, host_ifname: &str) -> LinkDescriptor {
        LinkDescriptor {
            container_id: container_id.to_string(),
            host_ifname: host_ifname.to_string(),
            container_ifname: self.args.ifname.clone(),
            netns: self.args.netns_path().unwrap_or_default(),
        }
    }

    fn wire(&self, pool: &EniPool, record: &AllocationRecord, link: &LinkDescriptor) -> Result<CniResult> {
        let eni = pool.find(&record.eni_interface).with_context(|| {
            format!(
                "ENI {} holding {} is no longer in the ENI map",
                record.eni_interface, record.address
            )
        })?;

        let (host_if, container_if) = Vether::new(&self.ip, self.config.mtu)
            .setup(record.address, link)
            .with_context(|| {
                format!("Error setting up interface for container {}", record.container_id)
            })?;

        info!(
            host = %host_if.name,
            container = %container_if.name,
            container_id = %record.container_id,
            "created interfaces"
        );

        PolicyRouter::new(&self.ip)
            .install(record.address, eni)
            .with_context(|| {
                format!("Error installing routing for container {}", record.container_id)
            })?;

        Ok(self.result(record.address, host_if, container_if))
    }

    /// Best-effort undo of a failed attach. Whatever is left behind is
    /// removed by a later DEL.
    ///
    /// Runs under the store lock and only while this attach still holds the
    /// claim; a retried attach that took over owns the links and rules now.
    fn rollback(&self, alloc: &Allocator<'_>, claim: &Allocation, link: &LinkDescriptor) {
        let record = &claim.record;
        let container_id = record.container_id.as_str();

        let undo = || {
            match RouteTable::for_attachment(record.eni_index) {
                Ok(table) => {
                    if let Err(e) = PolicyRouter::new(&self.ip).remove(record.address, table) {
                        warn!(container_id, error = %e, "rollback: failed to remove rules");
                    }
                }
                Err(e) => warn!(container_id, error = %e, "rollback: no route table"),
            }

            if let Err(e) = Vether::new(&self.ip, self.config.mtu).teardown(link) {
                warn!(container_id, error = %e, "rollback: failed to remove veth");
            }
        };

        match alloc.abandon(claim, undo) {
            Ok(true) if claim.created => {
                info!(container_id, address = %record.address, "rollback: released address")
            }
            Ok(true) => info!(container_id, "rollback: kept allocation made by an earlier attach"),
            Ok(false) => warn!(container_id, "rollback: skipped, a newer attach owns the container"),
            Err(e) => warn!(container_id, error = %e, "rollback: failed to release address"),
        }
    }

    fn result(
        &self,
        address: Ipv4Addr,
        host_if: crate::types::Interface,
        container_if: crate::types::Interface,
    ) -> CniResult {
        let gateway = CONTAINER_GATEWAY.to_string();
        let mut result = CniResult::new(&self.config.cni_version);

        result.add_interface(host_if);
        let container_idx = result.add_interface(container_if);

        result.add_ip(IPConfig {
            interface: Some(container_idx),
            address: format!("{}/32", address),
            gateway: Some(gateway.clone()),
        });
        result.add_route(CniRoute {
            dst: "0.0.0.0/0".to_string(),
            gw: Some(gateway),
        });

        result
    }
}
