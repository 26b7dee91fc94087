//! Maps container ids to pod addresses drawn from the ENI pool.
//!
//! The store is the only source of truth for which addresses are taken: the
//! free set is recomputed as (pool) minus (addresses in records) on every
//! call. Records are committed directly, there is no persisted "reserved"
//! state, so a record exists if and only if its address is in use.

use chrono::Utc;
use ring::digest;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::eni::EniPool;
use crate::store::{AllocationRecord, Store, StoreError};

/// Prefix of host-side veth names
pub const HOST_IFNAME_PREFIX: &str = "vpc";

/// Default time to wait for the store lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const IFNAME_HASH_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no free address left on any of {enis} ENIs ({capacity} addresses in use)")]
    PoolExhausted { enis: usize, capacity: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Deterministic host-side veth name for a container.
///
/// Derived from the container id alone so retries, rollbacks and detaches
/// without a record all find the same interface.
pub fn host_ifname(container_id: &str) -> String {
    format!("{}{}", HOST_IFNAME_PREFIX, ifname_suffix(container_id))
}

/// Name the container end carries while it still lives in the host namespace.
pub fn temp_peer_ifname(container_id: &str) -> String {
    format!("tmp{}", ifname_suffix(container_id))
}

fn ifname_suffix(container_id: &str) -> String {
    let hash = digest::digest(&digest::SHA256, container_id.as_bytes());
    hex::encode(hash.as_ref())[..IFNAME_HASH_LEN].to_string()
}

/// Outcome of [`Allocator::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The record, carrying this call's claim in `attach_id`
    pub record: AllocationRecord,
    /// False when the container already held the record before this call
    pub created: bool,
}

/// Address allocator over one store.
pub struct Allocator<'a> {
    store: &'a Store,
    lock_timeout: Duration,
}

impl<'a> Allocator<'a> {
    pub fn new(store: &'a Store, lock_timeout: Duration) -> Self {
        Self {
            store,
            lock_timeout,
        }
    }

    /// Assign an address to `container_id`.
    ///
    /// When the container already has a record, the same address and names
    /// come back and no second address is consumed. Either way the record is
    /// stamped with a fresh `attach_id`, so the caller holds the latest claim.
    pub fn allocate(
        &self,
        pool: &EniPool,
        container_id: &str,
        container_ifname: &str,
    ) -> Result<Allocation, AllocError> {
        let guard = self.store.lock(self.lock_timeout)?;

        if let Some(mut existing) = guard.get(container_id)? {
            info!(
                container_id,
                address = %existing.address,
                eni = %existing.eni_interface,
                "container already has an allocation"
            );
            existing.attach_id = Uuid::new_v4();
            guard.put(&existing)?;
            return Ok(Allocation {
                record: existing,
                created: false,
            });
        }

        let in_use: HashSet<Ipv4Addr> = guard.list()?.into_iter().map(|r| r.address).collect();
        debug!(in_use = in_use.len(), capacity = pool.capacity(), "computing free addresses");

        let (eni, address) = pool
            .enis()
            .iter()
            .find_map(|eni| {
                eni.addresses()
                    .iter()
                    .find(|address| !in_use.contains(*address))
                    .map(|address| (eni, *address))
            })
            .ok_or(AllocError::PoolExhausted {
                enis: pool.enis().len(),
                capacity: pool.capacity(),
            })?;

        let record = AllocationRecord {
            container_id: container_id.to_string(),
            address,
            eni_interface: eni.interface_name().to_string(),
            eni_index: eni.attachment_index(),
            host_ifname: host_ifname(container_id),
            container_ifname: container_ifname.to_string(),
            created_at: Utc::now(),
            attach_id: Uuid::new_v4(),
        };
        guard.put(&record)?;

        info!(
            container_id,
            address = %record.address,
            eni = %record.eni_interface,
            "allocated address"
        );
        Ok(Allocation {
            record,
            created: true,
        })
    }

    /// Undo a failed attach.
    ///
    /// Runs `undo` under the store lock, but only while `claim` is still the
    /// latest attach for its container, then releases the record if `claim`
    /// created it. Returns false, having done nothing, once a newer attach
    /// has taken the container over.
    pub fn abandon<F: FnOnce()>(&self, claim: &Allocation, undo: F) -> Result<bool, AllocError> {
        let record = &claim.record;
        let guard = self.store.lock(self.lock_timeout)?;

        match guard.get(&record.container_id)? {
            Some(current) if current.attach_id == record.attach_id => {}
            _ => {
                info!(
                    container_id = %record.container_id,
                    "attach was superseded, leaving its state to the newer attach"
                );
                return Ok(false);
            }
        }

        undo();

        if claim.created {
            guard.delete(&record.container_id)?;
            info!(
                container_id = %record.container_id,
                address = %record.address,
                "released address of failed attach"
            );
        }
        Ok(true)
    }

    /// Current record for `container_id`, if any
    pub fn lookup(&self, container_id: &str) -> Result<Option<AllocationRecord>, AllocError> {
        let guard = self.store.lock(self.lock_timeout)?;
        Ok(guard.get(container_id)?)
    }

    /// Release the allocation held by `container_id`.
    ///
    /// Releasing an id that holds nothing succeeds with `None`; detach may be
    /// called for containers whose attach never completed.
    pub fn release(&self, container_id: &str) -> Result<Option<AllocationRecord>, AllocError> {
        let guard = self.store.lock(self.lock_timeout)?;

        let Some(record) = guard.get(container_id)? else {
            debug!(container_id, "nothing allocated, release is a no-op");
            return Ok(None);
        };

        guard.delete(container_id)?;
        info!(
            container_id,
            address = %record.address,
            eni = %record.eni_interface,
            "released address"
        );
        Ok(Some(record))
    }

    /// All outstanding allocations
    pub fn allocations(&self) -> Result<Vec<AllocationRecord>, AllocError> {
        let guard = self.store.lock(self.lock_timeout)?;
        Ok(guard.list()?)
    }
}
