//! Network provisioning
//!
//! `provision` creates a project's network end to end: it claims a network
//! index, derives the network's block and VLAN from that index, and fills the
//! block's fixed IP pool. Each step is its own transaction. The fixed IP pool is
//! inserted all-or-nothing, but a failure there leaves the network with its
//! index and subnet in place and no addresses.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use pool_store::{
    FixedIp, FixedIpId, FloatingIp, Network, NetworkId, NetworkIndex, NetworkUpdate, PoolStore,
    PoolTransaction, StoreError,
};
use tracing::{debug, info, warn};

use crate::allocator::Allocator;
use crate::config::NetworkConfig;
use crate::error::{PoolError, Result};
use crate::subnet;

#[derive(Debug, Clone)]
pub struct NetworkProvisioner<S: PoolStore> {
    allocator: Allocator<S>,
    config: NetworkConfig,
}

impl<S: PoolStore> NetworkProvisioner<S> {
    pub fn new(store: S, config: NetworkConfig) -> Self {
        Self {
            allocator: Allocator::new(store),
            config,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Create and fully provision a network for `project_id`
    pub async fn provision(&self, project_id: &str) -> Result<Network> {
        self.ensure_indexes().await?;

        let network = self.create(project_id).await?;
        let index = match self.claim_index(network.id).await {
            Ok(index) => index,
            Err(e) => {
                // Nothing references the row yet, so drop it
                if let Err(cleanup) = self.delete_unclaimed(network.id).await {
                    warn!(network_id = network.id, "Failed to remove network without index: {}", cleanup);
                }
                return Err(e);
            }
        };

        let cidr = subnet::network_block(self.config.private_range, index, self.config.network_size)?;
        let mut update = cidr_update(cidr);
        let vlan = offset(self.config.vlan_start, index, "VLAN")?;
        update.vlan = Some(vlan);
        update.bridge = Some(format!("br{}", vlan));
        update.vpn_public_ip = Some(self.config.vpn_ip);
        update.vpn_public_port = Some(offset(self.config.vpn_start, index, "VPN port")?);
        update.kind = Some(self.config.network_type.clone());
        let network = self.update(network.id, update).await?;

        let count = self.create_fixed_ips(network.id).await?;
        info!(
            project_id,
            network_id = network.id,
            index,
            %cidr,
            vlan,
            fixed_ips = count,
            "Provisioned network"
        );
        Ok(network)
    }

    /// Populate the index pool with `num_networks` rows if it is empty.
    ///
    /// Safe to call concurrently: a caller that loses the race to populate
    /// sees the other caller's rows.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let mut tx = self.allocator.store().begin().await?;
        if tx.count::<NetworkIndex>()? > 0 {
            return Ok(());
        }
        for index in 0..self.config.num_networks {
            tx.insert(NetworkIndex::new(index))?;
        }
        match tx.commit().await {
            Ok(()) => {
                info!(count = self.config.num_networks, "Populated network indexes");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                debug!("Network indexes populated concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a network row with only its project set
    pub async fn create(&self, project_id: &str) -> Result<Network> {
        let mut tx = self.allocator.store().begin().await?;
        let network = tx.insert(Network::new(project_id))?;
        tx.commit().await?;
        debug!(project_id, network_id = network.id, "Created network");
        Ok(network)
    }

    pub async fn get(&self, network_id: NetworkId) -> Result<Network> {
        let tx = self.allocator.store().begin().await?;
        tx.get::<Network>(&network_id)?
            .ok_or_else(|| not_found(network_id))
    }

    /// First network owned by `project_id`
    pub async fn project_network(&self, project_id: &str) -> Result<Network> {
        let tx = self.allocator.store().begin().await?;
        tx.find::<Network, _>(|row| row.project_id == project_id)?
            .ok_or_else(|| PoolError::NotFound(format!("network for project {}", project_id)))
    }

    /// Delete a network and its fixed IPs. Its index stays bound.
    ///
    /// Floating IPs linked to the deleted fixed IPs are unlinked in the same
    /// transaction so they can return to their pool.
    pub async fn destroy(&self, network_id: NetworkId) -> Result<()> {
        let mut tx = self.allocator.store().begin().await?;
        tx.lock::<Network>(&network_id)
            .await?
            .ok_or_else(|| not_found(network_id))?;
        let fixed_ips = tx.filter::<FixedIp, _>(|row| row.network_id == network_id)?;
        let fixed_ids: BTreeSet<FixedIpId> = fixed_ips.iter().map(|ip| ip.id).collect();

        let linked = tx.filter::<FloatingIp, _>(|row| {
            row.fixed_ip_id.is_some_and(|id| fixed_ids.contains(&id))
        })?;
        let mut unlinked = 0;
        for candidate in linked {
            // Re-read under the lock; the link may have moved meanwhile
            let Some(mut floating) = tx.lock::<FloatingIp>(&candidate.id).await? else {
                continue;
            };
            if floating.fixed_ip_id.is_some_and(|id| fixed_ids.contains(&id)) {
                debug!(network_id, floating = %floating.address, "Unlinking floating IP");
                floating.fixed_ip_id = None;
                tx.update(floating)?;
                unlinked += 1;
            }
        }

        for id in &fixed_ids {
            tx.delete::<FixedIp>(id)?;
        }
        tx.delete::<Network>(&network_id)?;
        tx.commit().await?;
        info!(
            network_id,
            fixed_ips = fixed_ids.len(),
            floating_ips_unlinked = unlinked,
            "Destroyed network"
        );
        Ok(())
    }

    /// Claim a free index for `network_id`
    pub async fn claim_index(&self, network_id: NetworkId) -> Result<u32> {
        let row = self
            .allocator
            .claim_one(
                |_: &NetworkIndex| true,
                |row: &mut NetworkIndex| row.network_id = Some(network_id),
            )
            .await?;
        Ok(row.index)
    }

    /// Copy the set fields of `update` onto the network
    pub async fn update(&self, network_id: NetworkId, update: NetworkUpdate) -> Result<Network> {
        self.allocator
            .modify_one(
                |row: &Network| row.id == network_id,
                |row: &mut Network| {
                    update.apply_to(row);
                    Ok(())
                },
            )
            .await?
            .ok_or_else(|| not_found(network_id))
    }

    /// Store `cidr` and the addresses derived from it
    pub async fn set_cidr(&self, network_id: NetworkId, cidr: Ipv4Net) -> Result<Network> {
        self.update(network_id, cidr_update(cidr)).await
    }

    /// Insert one fixed IP per address of the network's block, reserving the
    /// bottom three and the top `1 + cnt_vpn_clients`. Returns the number
    /// inserted.
    pub async fn create_fixed_ips(&self, network_id: NetworkId) -> Result<usize> {
        let mut tx = self.allocator.store().begin().await?;
        let network = tx
            .get::<Network>(&network_id)?
            .ok_or_else(|| not_found(network_id))?;
        let cidr = network
            .cidr
            .ok_or_else(|| PoolError::NotFound(format!("cidr of network {}", network_id)))?;

        let total = 1u64 << (32 - u32::from(cidr.prefix_len()));
        let mut count = 0;
        for (i, address) in (0u64..).zip(subnet::addresses(cidr)) {
            let reserved = subnet::is_reserved(i, total, self.config.cnt_vpn_clients);
            tx.insert(FixedIp::new(address, network_id, reserved))?;
            count += 1;
        }
        tx.commit().await?;
        debug!(network_id, %cidr, count, "Created fixed IPs");
        Ok(count)
    }

    /// Assign the network to `host_id` unless a host already has it.
    /// Returns the host that ends up owning the network.
    pub async fn set_host(&self, network_id: NetworkId, host_id: &str) -> Result<String> {
        let mut tx = self.allocator.store().begin().await?;
        let mut network = tx
            .lock::<Network>(&network_id)
            .await?
            .ok_or_else(|| not_found(network_id))?;

        if let Some(existing) = network.node_name.clone() {
            tx.rollback().await?;
            debug!(network_id, host = %existing, "Network already has a host");
            return Ok(existing);
        }

        network.node_name = Some(host_id.to_string());
        tx.update(network)?;
        tx.commit().await?;
        info!(network_id, host = host_id, "Assigned network host");
        Ok(host_id.to_string())
    }

    pub async fn get_host(&self, network_id: NetworkId) -> Result<Option<String>> {
        Ok(self.get(network_id).await?.node_name)
    }

    /// Mark the network's VPN private address as allocated
    pub async fn reserve_vpn_ip(&self, network_id: NetworkId) -> Result<Ipv4Addr> {
        let network = self.get(network_id).await?;
        let address = network.vpn_private_ip.ok_or_else(|| {
            PoolError::NotFound(format!("VPN address of network {}", network_id))
        })?;

        self.allocator
            .modify_one(
                |row: &FixedIp| row.network_id == network_id && row.address == address,
                |row: &mut FixedIp| {
                    if row.allocated {
                        return Err(PoolError::AddressAlreadyAllocated(address));
                    }
                    row.allocated = true;
                    Ok(())
                },
            )
            .await?
            .ok_or_else(|| PoolError::NotFound(format!("fixed IP {}", address)))?;
        info!(network_id, %address, "Reserved VPN address");
        Ok(address)
    }

    async fn delete_unclaimed(&self, network_id: NetworkId) -> Result<()> {
        let mut tx = self.allocator.store().begin().await?;
        tx.delete::<Network>(&network_id)?;
        tx.commit().await?;
        Ok(())
    }
}

/// Update carrying `cidr` and everything derived from it
fn cidr_update(cidr: Ipv4Net) -> NetworkUpdate {
    let derived = subnet::block_addresses(cidr);
    NetworkUpdate {
        cidr: Some(cidr),
        netmask: Some(derived.netmask),
        gateway: Some(derived.gateway),
        broadcast: Some(derived.broadcast),
        vpn_private_ip: Some(derived.vpn_private_ip),
        ..Default::default()
    }
}

fn offset(start: u16, index: u32, what: &str) -> Result<u16> {
    u32::from(start)
        .checked_add(index)
        .and_then(|value| u16::try_from(value).ok())
        .ok_or_else(|| PoolError::InvalidConfig(format!("{} for index {} overflows", what, index)))
}

fn not_found(network_id: NetworkId) -> PoolError {
    PoolError::NotFound(format!("network {}", network_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_ip::FixedIpManager;
    use crate::floating_ip::FloatingIpManager;
    use pool_store::MemoryPoolStore;
    use pool_store::testing::{seed_fixed_ips, seed_network, test_address};

    fn small_config(num_networks: u32) -> NetworkConfig {
        NetworkConfig {
            num_networks,
            network_size: 16,
            cnt_vpn_clients: 2,
            vpn_ip: Ipv4Addr::new(203, 0, 113, 1),
            ..Default::default()
        }
    }

    fn provisioner(num_networks: u32) -> NetworkProvisioner<MemoryPoolStore> {
        NetworkProvisioner::new(MemoryPoolStore::new(), small_config(num_networks))
    }

    #[tokio::test]
    async fn test_provision_fills_network_fields() {
        let provisioner = provisioner(4);

        let first = provisioner.provision("proj-a").await.unwrap();
        let second = provisioner.provision("proj-b").await.unwrap();

        assert_eq!(first.cidr.unwrap().to_string(), "10.0.0.0/28");
        assert_eq!(first.netmask, Some(Ipv4Addr::new(255, 255, 255, 240)));
        assert_eq!(first.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(first.vpn_private_ip, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(first.broadcast, Some(Ipv4Addr::new(10, 0, 0, 15)));
        assert_eq!(first.vlan, Some(100));
        assert_eq!(first.bridge.as_deref(), Some("br100"));
        assert_eq!(first.vpn_public_ip, Some(Ipv4Addr::new(203, 0, 113, 1)));
        assert_eq!(first.vpn_public_port, Some(1000));
        assert_eq!(first.kind.as_deref(), Some("vlan"));

        assert_eq!(second.cidr.unwrap().to_string(), "10.0.0.16/28");
        assert_eq!(second.vlan, Some(101));
        assert_eq!(second.bridge.as_deref(), Some("br101"));
        assert_eq!(second.vpn_public_port, Some(1001));
    }

    #[tokio::test]
    async fn test_fixed_ip_reservation_boundary() {
        let provisioner = provisioner(1);
        let network = provisioner.provision("proj-a").await.unwrap();

        let tx = provisioner.allocator.store().begin().await.unwrap();
        let ips = tx
            .filter::<FixedIp, _>(|row| row.network_id == network.id)
            .unwrap();
        assert_eq!(ips.len(), 16);

        let reserved: Vec<u8> = ips
            .iter()
            .filter(|ip| ip.reserved)
            .map(|ip| ip.address.octets()[3])
            .collect();
        // bottom 3, then broadcast plus 2 VPN clients
        assert_eq!(reserved, vec![0, 1, 2, 13, 14, 15]);
        assert!(ips.iter().all(|ip| !ip.allocated && !ip.leased));
    }

    #[tokio::test]
    async fn test_exhausted_indexes_leave_no_network_behind() {
        let provisioner = provisioner(1);
        provisioner.provision("proj-a").await.unwrap();

        let result = provisioner.provision("proj-b").await;
        assert!(matches!(result, Err(PoolError::NoMoreNetworks)));
        assert!(matches!(
            provisioner.project_network("proj-b").await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_indexes_only_populates_once() {
        let provisioner = provisioner(3);
        provisioner.ensure_indexes().await.unwrap();
        provisioner.ensure_indexes().await.unwrap();

        let tx = provisioner.allocator.store().begin().await.unwrap();
        assert_eq!(tx.count::<NetworkIndex>().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_set_host_first_wins() {
        let provisioner = provisioner(1);
        let network = provisioner.create("proj-a").await.unwrap();

        assert_eq!(provisioner.get_host(network.id).await.unwrap(), None);
        assert_eq!(provisioner.set_host(network.id, "node-1").await.unwrap(), "node-1");
        assert_eq!(provisioner.set_host(network.id, "node-2").await.unwrap(), "node-1");
        assert_eq!(
            provisioner.get_host(network.id).await.unwrap().as_deref(),
            Some("node-1")
        );
    }

    #[tokio::test]
    async fn test_set_host_unknown_network() {
        let provisioner = provisioner(1);
        assert!(matches!(
            provisioner.set_host(99, "node-1").await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reserve_vpn_ip_only_once() {
        let provisioner = provisioner(1);
        let network = provisioner.provision("proj-a").await.unwrap();

        let address = provisioner.reserve_vpn_ip(network.id).await.unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(
            provisioner.reserve_vpn_ip(network.id).await,
            Err(PoolError::AddressAlreadyAllocated(a)) if a == address
        ));
    }

    #[tokio::test]
    async fn test_create_fixed_ips_requires_cidr() {
        let provisioner = provisioner(1);
        let network = provisioner.create("proj-a").await.unwrap();
        assert!(matches!(
            provisioner.create_fixed_ips(network.id).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_removes_fixed_ips() {
        let provisioner = provisioner(2);
        let network = provisioner.provision("proj-a").await.unwrap();

        provisioner.destroy(network.id).await.unwrap();

        assert!(matches!(
            provisioner.get(network.id).await,
            Err(PoolError::NotFound(_))
        ));
        let tx = provisioner.allocator.store().begin().await.unwrap();
        assert_eq!(
            tx.filter::<FixedIp, _>(|row| row.network_id == network.id)
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn test_destroy_returns_linked_floating_ip_to_pool() {
        let provisioner = provisioner(1);
        let store = provisioner.allocator.store().clone();
        let floating_ips = FloatingIpManager::new(store.clone());
        let fixed_ips = FixedIpManager::new(store);
        floating_ips
            .create("node-1", Ipv4Addr::new(198, 51, 100, 7))
            .await
            .unwrap();

        let network = provisioner.provision("proj-a").await.unwrap();
        let fixed = fixed_ips.allocate(network.id).await.unwrap();
        let floating = floating_ips.allocate("node-1", "proj-a").await.unwrap();
        floating_ips.associate(floating, fixed).await.unwrap();

        provisioner.destroy(network.id).await.unwrap();

        let row = floating_ips.get_by_address(floating).await.unwrap();
        assert_eq!(row.fixed_ip_id, None);
        assert_eq!(row.project_id.as_deref(), Some("proj-a"));

        floating_ips.deallocate(floating).await.unwrap();
        assert_eq!(
            floating_ips.allocate("node-1", "proj-b").await.unwrap(),
            floating
        );
    }

    #[tokio::test]
    async fn test_failed_fixed_ip_population_inserts_nothing() {
        let provisioner = provisioner(1);
        let store = provisioner.allocator.store().clone();
        // Another network already owns 10.0.0.5, inside index 0's block
        let other = seed_network(&store, "proj-x").await.unwrap();
        seed_fixed_ips(&store, other.id, [test_address(0, 5)])
            .await
            .unwrap();

        let result = provisioner.provision("proj-a").await;
        assert!(matches!(
            result,
            Err(PoolError::Store(StoreError::Conflict(_)))
        ));

        let network = provisioner.project_network("proj-a").await.unwrap();
        assert_eq!(network.cidr.unwrap().to_string(), "10.0.0.0/28");
        let tx = store.begin().await.unwrap();
        assert!(
            tx.filter::<FixedIp, _>(|row| row.network_id == network.id)
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            tx.filter::<FixedIp, _>(|row| row.network_id == other.id)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_set_cidr_derives_addresses() {
        let provisioner = provisioner(1);
        let network = provisioner.create("proj-a").await.unwrap();

        let updated = provisioner
            .set_cidr(network.id, "192.168.4.0/24".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(updated.gateway, Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert_eq!(updated.broadcast, Some(Ipv4Addr::new(192, 168, 4, 255)));
        assert_eq!(updated.node_name, None);
    }

    #[test]
    fn test_offset_overflow() {
        assert_eq!(offset(100, 5, "VLAN").unwrap(), 105);
        assert!(matches!(
            offset(u16::MAX, 1, "VPN port"),
            Err(PoolError::InvalidConfig(_))
        ));
    }
}
