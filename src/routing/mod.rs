//! Source-based policy routing for pod addresses.
//!
//! Each ENI gets its own route table holding the ENI subnet and a default
//! route via the ENI gateway. A rule sends traffic sourced from a pod address
//! to the table of the ENI that owns it; without it replies would follow the
//! host default route out the primary interface and be dropped by the VPC
//! source/destination check. A second, higher priority rule keeps traffic
//! destined to a local pod in the main table.

use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info};

use crate::eni::Eni;
use crate::ip::{IpError, IpRunner};

/// Route table of the ENI with attachment index 0
pub const ENI_TABLE_BASE: u32 = 100;
/// Highest table id below the kernel reserved ones (default, main, local)
pub const MAX_TABLE_ID: u32 = 252;
/// Priority of the `to <pod> lookup main` rule
pub const TO_POD_RULE_PRIORITY: u32 = 512;
/// Priority of the `from <pod> lookup <eni table>` rule
pub const FROM_POD_RULE_PRIORITY: u32 = 1536;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("attachment index {index} has no free route table id (ids stop at 252)")]
    RouteTableFull { index: u32 },

    #[error("failed to install route in table {table}")]
    RouteInstallFailed {
        table: RouteTable,
        #[source]
        source: IpError,
    },

    #[error("failed to install rule for {address}")]
    RuleInstallFailed {
        address: Ipv4Addr,
        #[source]
        source: IpError,
    },

    #[error("failed to remove rule for {address}")]
    RuleRemoveFailed {
        address: Ipv4Addr,
        #[source]
        source: IpError,
    },
}

/// Route table id dedicated to one ENI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTable(u32);

impl RouteTable {
    pub fn for_attachment(index: u32) -> Result<Self, RoutingError> {
        index
            .checked_add(ENI_TABLE_BASE)
            .filter(|id| *id <= MAX_TABLE_ID)
            .map(RouteTable)
            .ok_or(RoutingError::RouteTableFull { index })
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Installs and removes per-pod rules.
pub struct PolicyRouter<R> {
    ip: R,
}

impl<R: IpRunner> PolicyRouter<R> {
    pub fn new(ip: R) -> Self {
        Self { ip }
    }

    /// Make traffic from `address` leave through `eni`.
    pub fn install(&self, address: Ipv4Addr, eni: &Eni) -> Result<RouteTable, RoutingError> {
        let table = RouteTable::for_attachment(eni.attachment_index())?;
        let table_id = table.to_string();
        let dev = eni.interface_name();
        let subnet = eni.subnet().to_string();
        let gateway = eni.gateway().to_string();

        let route = |source| RoutingError::RouteInstallFailed { table, source };
        self.ip
            .run(
                None,
                &["route", "replace", &subnet, "dev", dev, "scope", "link", "table", &table_id],
            )
            .map_err(route)?;
        self.ip
            .run(
                None,
                &["route", "replace", "default", "via", &gateway, "dev", dev, "table", &table_id],
            )
            .map_err(route)?;

        // `ip rule add` happily duplicates rules, so clear any leftover first.
        let to_pod = Rule::to_pod(address);
        let from_pod = Rule::from_pod(address, table);
        for rule in [&to_pod, &from_pod] {
            self.delete_rule(rule)
                .map_err(|source| RoutingError::RuleInstallFailed { address, source })?;
            self.ip
                .run(None, &rule.args("add"))
                .map_err(|source| RoutingError::RuleInstallFailed { address, source })?;
        }

        info!(%address, eni = dev, table = table.id(), "policy routing installed");
        Ok(table)
    }

    /// Remove the rules for `address`. Rules that are already gone are fine.
    pub fn remove(&self, address: Ipv4Addr, table: RouteTable) -> Result<(), RoutingError> {
        for rule in [Rule::from_pod(address, table), Rule::to_pod(address)] {
            self.delete_rule(&rule)
                .map_err(|source| RoutingError::RuleRemoveFailed { address, source })?;
        }
        debug!(%address, table = table.id(), "policy routing removed");
        Ok(())
    }

    /// Whether the source rule for `address` is present.
    pub fn is_installed(&self, address: Ipv4Addr, table: RouteTable) -> Result<bool, IpError> {
        let from = format!("{}/32", address);
        let out = self.ip.run(None, &["rule", "show", "from", &from])?;
        let lookup = format!("lookup {}", table);
        Ok(out.lines().any(|line| line.contains(&lookup)))
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), IpError> {
        match self.ip.run(None, &rule.args("del")) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// One exact-match policy rule.
struct Rule {
    selector: &'static str,
    prefix: String,
    table: String,
    priority: String,
}

impl Rule {
    fn from_pod(address: Ipv4Addr, table: RouteTable) -> Self {
        Self {
            selector: "from",
            prefix: format!("{}/32", address),
            table: table.to_string(),
            priority: FROM_POD_RULE_PRIORITY.to_string(),
        }
    }

    fn to_pod(address: Ipv4Addr) -> Self {
        Self {
            selector: "to",
            prefix: format!("{}/32", address),
            table: "main".to_string(),
            priority: TO_POD_RULE_PRIORITY.to_string(),
        }
    }

    fn args<'a>(&'a self, verb: &'a str) -> Vec<&'a str> {
        vec![
            "rule",
            verb,
            self.selector,
            &self.prefix,
            "table",
            &self.table,
            "priority",
            &self.priority,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eni::{EniEntry, EniPool};
    use crate::ip::fake::FakeIp;

    fn eni(index: u32) -> Eni {
        let pool = EniPool::from_entries(vec![EniEntry {
            eni_id: "eni-2".to_string(),
            interface_name: "eth2".to_string(),
            attachment_index: index,
            mac_address: None,
            subnet: Some("10.0.2.0/24".parse().unwrap()),
            gateway: None,
            interface_ip: None,
            ips: vec!["10.0.2.9".parse().unwrap()],
        }])
        .unwrap();
        pool.enis()[0].clone()
    }

    #[test]
    fn table_ids_are_bounded() {
        assert_eq!(RouteTable::for_attachment(0).unwrap().id(), 100);
        assert_eq!(RouteTable::for_attachment(152).unwrap().id(), 252);
        assert!(matches!(
            RouteTable::for_attachment(153),
            Err(RoutingError::RouteTableFull { index: 153 })
        ));
        assert!(RouteTable::for_attachment(u32::MAX).is_err());
    }

    #[test]
    fn install_sets_table_and_rules() {
        let ip = FakeIp::new();
        let table = PolicyRouter::new(&ip)
            .install("10.0.2.9".parse().unwrap(), &eni(2))
            .unwrap();

        assert_eq!(table.id(), 102);
        assert_eq!(
            ip.commands(),
            vec![
                "route replace 10.0.2.0/24 dev eth2 scope link table 102",
                "route replace default via 10.0.2.1 dev eth2 table 102",
                "rule del to 10.0.2.9/32 table main priority 512",
                "rule add to 10.0.2.9/32 table main priority 512",
                "rule del from 10.0.2.9/32 table 102 priority 1536",
                "rule add from 10.0.2.9/32 table 102 priority 1536",
            ]
        );
    }

    #[test]
    fn install_reports_rule_failures() {
        let ip = FakeIp::new();
        ip.fail(
            "rule add from 10.0.2.9/32 table 102 priority 1536",
            "RTNETLINK answers: Operation not permitted",
        );
        let err = PolicyRouter::new(&ip)
            .install("10.0.2.9".parse().unwrap(), &eni(2))
            .unwrap_err();
        assert!(matches!(err, RoutingError::RuleInstallFailed { .. }));

        // Each cause shows up once in the rendered chain.
        let rendered = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(rendered.matches("Operation not permitted").count(), 1);
        assert!(rendered.starts_with("failed to install rule for 10.0.2.9: ip rule add"));
    }

    #[test]
    fn remove_is_exact_and_tolerates_missing_rules() {
        let ip = FakeIp::new();
        ip.fail(
            "rule del from 10.0.2.9/32 table 102 priority 1536",
            "RTNETLINK answers: No such file or directory",
        );

        let table = RouteTable::for_attachment(2).unwrap();
        PolicyRouter::new(&ip)
            .remove("10.0.2.9".parse().unwrap(), table)
            .unwrap();
        assert_eq!(
            ip.commands(),
            vec![
                "rule del from 10.0.2.9/32 table 102 priority 1536",
                "rule del to 10.0.2.9/32 table main priority 512",
            ]
        );
    }

    #[test]
    fn detects_installed_rule() {
        let ip = FakeIp::new();
        ip.respond(
            "rule show from 10.0.2.9/32",
            "1536:\tfrom 10.0.2.9 lookup 102\n",
        );
        let router = PolicyRouter::new(&ip);
        let table = RouteTable::for_attachment(2).unwrap();
        assert!(router.is_installed("10.0.2.9".parse().unwrap(), table).unwrap());
        assert!(!router
            .is_installed("10.0.2.9".parse().unwrap(), RouteTable::for_attachment(3).unwrap())
            .unwrap());
    }
}
