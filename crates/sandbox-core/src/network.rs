//! Network Manager (spec §4.2). Grounded in `core/net.rs`
//! (`ensure_bridge`, `create_tap_with_vlan`, `delete_tap`) generalized from
//! "attach a fixed tap name handed in by the caller" to owning IP/tap
//! allocation itself, plus the per-VM egress chain from spec §4.2/§9.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::host_actions::{ChainRule, HostActions};
use crate::model::VmRecord;

/// Monotonic IP/tap allocator. Design Note (spec §9): process-local and
/// unsynchronized allocation is intentional; on startup it is seeded above
/// the maximum observed allocation from persisted records so a crash
/// between allocate and persist merely leaks an address rather than
/// double-assigning one.
pub struct Allocator {
    subnet_base: u32, // host byte order, e.g. 10.42.0.0
    next_host_octet: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub guest_ip: String,
    pub tap_name: String,
}

impl Allocator {
    pub fn new(subnet_cidr: &str) -> CoreResult<Self> {
        let (network, _) = subnet_cidr
            .split_once('/')
            .ok_or_else(|| CoreError::validation(format!("invalid subnet cidr {subnet_cidr}")))?;
        let addr = Ipv4Addr::from_str(network)
            .map_err(|e| CoreError::validation(format!("invalid subnet address: {e}")))?;
        Ok(Self {
            subnet_base: u32::from(addr),
            next_host_octet: AtomicU32::new(2),
        })
    }

    /// Seed the counter above the highest octet already in use — called
    /// once at startup with the persisted store's live guest IPs.
    pub fn seed_above(&self, used_guest_ips: &[String]) {
        let mut max_seen = 1u32;
        for ip in used_guest_ips {
            if let Ok(addr) = Ipv4Addr::from_str(ip) {
                let host = u32::from(addr).wrapping_sub(self.subnet_base) & 0xff;
                max_seen = max_seen.max(host);
            }
        }
        self.next_host_octet.fetch_max(max_seen + 1, Ordering::SeqCst);
    }

    pub fn allocate(&self) -> CoreResult<Allocation> {
        let octet = self.next_host_octet.fetch_add(1, Ordering::SeqCst);
        if octet > 254 {
            return Err(CoreError::conflict("subnet exhausted"));
        }
        let ip = Ipv4Addr::from(self.subnet_base | octet);
        Ok(Allocation {
            guest_ip: ip.to_string(),
            tap_name: format!("tap-{octet}"),
        })
    }
}

#[derive(Clone, Default)]
pub struct ConfigureOptions {
    pub up: bool,
}

pub struct NetworkManager {
    bridge_name: String,
    gateway_ip: String,
    subnet_cidr: String,
    host: Arc<dyn HostActions>,
    bridge_lock: Mutex<()>,
}

/// `RDS_<sanitized-tap>`, truncated to 29 characters — iptables' own chain
/// name limit is 28 bytes + nul, the 29-char budget here mirrors that.
pub fn chain_name(tap_name: &str) -> String {
    let sanitized: String = tap_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut name = format!("RDS_{sanitized}");
    name.truncate(29);
    name
}

impl NetworkManager {
    pub fn new(
        bridge_name: impl Into<String>,
        gateway_ip: impl Into<String>,
        subnet_cidr: impl Into<String>,
        host: Arc<dyn HostActions>,
    ) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            gateway_ip: gateway_ip.into(),
            subnet_cidr: subnet_cidr.into(),
            host,
            bridge_lock: Mutex::new(()),
        }
    }

    fn chain_rules(&self, vm: &VmRecord) -> Vec<ChainRule> {
        let mut rules = vec![ChainRule::AcceptEstablishedRelated];
        if vm.outbound_internet {
            for ip in &vm.allow_ips {
                rules.push(ChainRule::AcceptDest(ip.clone()));
            }
        }
        rules.push(ChainRule::Drop);
        rules
    }

    pub async fn configure(
        &self,
        vm: &VmRecord,
        tap_name: &str,
        opts: ConfigureOptions,
    ) -> CoreResult<()> {
        {
            let _guard = self.bridge_lock.lock().await;
            let prefix = self.subnet_cidr.split('/').nth(1).unwrap_or("24");
            let gw_cidr = format!("{}/{}", self.gateway_ip, prefix);
            self.host.ensure_bridge(&self.bridge_name, &gw_cidr).await?;
            if vm.outbound_internet {
                self.host.ensure_nat_masquerade(&self.subnet_cidr).await?;
            }
        }

        self.host.delete_tap_if_exists(tap_name).await?;
        self.host.create_tap(tap_name).await?;
        self.host.attach_to_bridge(tap_name, &self.bridge_name).await?;
        if opts.up {
            self.host.set_link_up(tap_name).await?;
        }

        let chain = chain_name(tap_name);
        let rules = self.chain_rules(vm);
        self.host
            .ensure_per_vm_chain(&chain, &self.bridge_name, &vm.guest_ip, &rules)
            .await?;
        Ok(())
    }

    pub async fn bring_up_tap(&self, tap_name: &str) -> CoreResult<()> {
        self.host.set_link_up(tap_name).await
    }

    pub async fn teardown(&self, vm: &VmRecord, tap_name: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        let chain = chain_name(tap_name);
        if let Err(e) = self
            .host
            .delete_chain_jumps(&chain, &self.bridge_name, &vm.guest_ip)
            .await
        {
            warnings.push(format!("chain teardown: {e}"));
        }
        if let Err(e) = self.host.delete_tap(tap_name).await {
            warnings.push(format!("tap delete: {e}"));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::VmState;

    fn sample_vm(outbound: bool, allow_ips: Vec<String>) -> VmRecord {
        VmRecord {
            id: uuid::Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            cpu: 1,
            mem_mb: 256,
            vsock_cid: 5000,
            tap_name: "tap-5".into(),
            guest_ip: "10.42.0.5".into(),
            outbound_internet: outbound,
            allow_ips,
            rootfs_path: "/x".into(),
            kernel_path: "/y".into(),
            logs_dir: "/z".into(),
            image_id: None,
            state: VmState::Created,
            provision_mode: None,
        }
    }

    #[test]
    fn allocator_assigns_monotonic_ips_from_host_2() {
        let alloc = Allocator::new("10.42.0.0/24").unwrap();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!(a.guest_ip, "10.42.0.2");
        assert_eq!(a.tap_name, "tap-2");
        assert_eq!(b.guest_ip, "10.42.0.3");
    }

    #[test]
    fn allocator_seeds_above_observed_max() {
        let alloc = Allocator::new("10.42.0.0/24").unwrap();
        alloc.seed_above(&["10.42.0.9".to_string(), "10.42.0.3".to_string()]);
        let next = alloc.allocate().unwrap();
        assert_eq!(next.guest_ip, "10.42.0.10");
    }

    #[test]
    fn chain_name_is_sanitized_and_truncated() {
        let name = chain_name("tap-123456789012345678901234567890");
        assert!(name.starts_with("RDS_"));
        assert!(name.len() <= 29);
    }

    #[tokio::test]
    async fn deny_by_default_chain_has_no_allow_rule() {
        use crate::host_actions::RecordingHostActions;
        let host = Arc::new(RecordingHostActions::default());
        let mgr = NetworkManager::new("sbxbr0", "10.42.0.1", "10.42.0.0/24", host.clone());
        let vm = sample_vm(false, vec!["8.8.8.8/32".into()]);
        mgr.configure(&vm, "tap-5", ConfigureOptions { up: true }).await.unwrap();
        let calls = host.calls_snapshot();
        let chain_call = calls.iter().find(|c| c.starts_with("ensure_per_vm_chain")).unwrap();
        // outbound_internet=false -> only ESTABLISHED,RELATED + DROP == 2 rules
        assert!(chain_call.contains("n_rules=2"));
    }

    #[tokio::test]
    async fn idempotent_configure_does_not_panic_on_repeat() {
        use crate::host_actions::RecordingHostActions;
        let host = Arc::new(RecordingHostActions::default());
        let mgr = NetworkManager::new("sbxbr0", "10.42.0.1", "10.42.0.0/24", host.clone());
        let vm = sample_vm(true, vec!["1.2.3.4/32".into()]);
        mgr.configure(&vm, "tap-5", ConfigureOptions { up: true }).await.unwrap();
        mgr.configure(&vm, "tap-5", ConfigureOptions { up: true }).await.unwrap();
        let calls = host.calls_snapshot();
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("ensure_per_vm_chain")).count(),
            2
        );
    }
}
