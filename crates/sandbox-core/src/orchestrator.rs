//! Lifecycle Orchestrator (spec §4.5) — the central state machine tying
//! together storage, network, hypervisor, vsock, and the store. Grounded in
//! `features/vms::service` (quota checks before mutation,
//! state transitions persisted through the repo, activity emission on every
//! transition) generalized to the jailed-hypervisor + vsock control flow
//! this spec describes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use sandbox_types::{ProvisionMode, VmState};

use crate::activity::ActivityBus;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::host_actions::HostActions;
use crate::hypervisor::HypervisorSupervisor;
use crate::model::{SnapshotMeta, VmRecord};
use crate::network::{Allocator, ConfigureOptions, NetworkManager};
use crate::storage::StorageProvider;
use crate::store::Store;
use crate::versioner::template_snapshot_id;
use crate::vsock::{ConfigureNetworkBody, VsockAgentClient};

const MIN_CID: u32 = 5000;

/// Monotonic vsock CID counter. Same process-local/unsynchronized Design
/// Note as the IP/tap `Allocator` in `network.rs` — seeded above the
/// maximum persisted CID at startup.
struct CidAllocator(AtomicU32);

impl CidAllocator {
    fn new() -> Self {
        Self(AtomicU32::new(MIN_CID))
    }

    fn seed_above(&self, used: &[u32]) {
        let max = used.iter().copied().max().unwrap_or(MIN_CID - 1);
        self.0.fetch_max(max + 1, Ordering::SeqCst);
    }

    fn allocate(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    config: Config,
    store: Store,
    network: NetworkManager,
    storage: StorageProvider,
    hypervisor: HypervisorSupervisor,
    vsock: VsockAgentClient,
    activity: ActivityBus,
    ip_allocator: Allocator,
    cid_allocator: CidAllocator,
    vm_locks: AsyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    // Hypervisor pids are process-local, like the allocators above: the
    // store only persists state a caller needs, not the supervising pid.
    pids: AsyncMutex<HashMap<Uuid, u32>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Store,
        host: Arc<dyn HostActions>,
    ) -> CoreResult<Self> {
        let network = NetworkManager::new(
            config.bridge_name.clone(),
            config.gateway_ip.clone(),
            config.subnet_cidr.clone(),
            host.clone(),
        );
        let storage = StorageProvider::new(
            config.chroot_base.clone(),
            config.storage_root.clone(),
            config.rootfs_clone_mode,
            host.clone(),
        );
        let hypervisor = HypervisorSupervisor::new(host, config.jailer_uid, config.jailer_gid);
        let vsock = VsockAgentClient::new(config.vsock.clone())?;
        let activity = ActivityBus::spawn(config.activity_webhook_url.clone());
        let ip_allocator = Allocator::new(&config.subnet_cidr)?;

        Ok(Self {
            config,
            store,
            network,
            storage,
            hypervisor,
            vsock,
            activity,
            ip_allocator,
            cid_allocator: CidAllocator::new(),
            vm_locks: AsyncMutex::new(HashMap::new()),
            pids: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Run the §9 "opaque database access" startup normalization, then seed
    /// both process-local allocators above whatever the store has observed.
    pub async fn bootstrap(&self) -> CoreResult<()> {
        let fixed = self.store.normalize_on_startup().await?;
        if fixed > 0 {
            info!(fixed, "normalized transient vm states on startup");
        }
        let vms = self.store.list().await?;
        let ips: Vec<String> = vms.iter().map(|v| v.guest_ip.clone()).collect();
        self.ip_allocator.seed_above(&ips);
        let cids: Vec<u32> = vms.iter().map(|v| v.vsock_cid).collect();
        self.cid_allocator.seed_above(&cids);
        Ok(())
    }

    async fn lock_for(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut guard = self.vm_locks.lock().await;
        guard.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn validate_quotas(&self, cpu: u32, mem_mb: u32, allow_ips: &[String]) -> CoreResult<()> {
        if cpu == 0 || cpu > self.config.max_cpu {
            return Err(CoreError::validation(format!(
                "cpu {cpu} exceeds max {}",
                self.config.max_cpu
            )));
        }
        if mem_mb == 0 || mem_mb > self.config.max_mem_mb {
            return Err(CoreError::validation(format!(
                "memMb {mem_mb} exceeds max {}",
                self.config.max_mem_mb
            )));
        }
        if allow_ips.len() > self.config.max_allow_ips {
            return Err(CoreError::validation(format!(
                "allowIps length {} exceeds max {}",
                allow_ips.len(),
                self.config.max_allow_ips
            )));
        }
        for ip in allow_ips {
            if !is_valid_cidr_or_ip(ip) {
                return Err(CoreError::validation(format!("invalid allowIps entry: {ip}")));
            }
        }
        Ok(())
    }

    fn validate_disk_size(&self, requested_mb: Option<u64>, base_rootfs_bytes: u64) -> CoreResult<u64> {
        let min_mb = (base_rootfs_bytes + (1024 * 1024) - 1) / (1024 * 1024);
        const MAX_MB: u64 = 1_048_576;
        match requested_mb {
            None => Ok(min_mb + self.config.disk_size_headroom_mb),
            Some(mb) => {
                if mb < min_mb || mb > MAX_MB {
                    Err(CoreError::validation(format!(
                        "diskSizeMb {mb} out of range [{min_mb}, {MAX_MB}]"
                    )))
                } else {
                    Ok(mb)
                }
            }
        }
    }

    fn base_image_paths(&self, image_id: Option<&str>) -> (String, String) {
        let id = image_id.unwrap_or("default");
        (
            format!("{}/images/{id}/vmlinux", self.config.storage_root),
            format!("{}/images/{id}/rootfs.ext4", self.config.storage_root),
        )
    }

    fn mac_for(vm_id: &Uuid) -> String {
        crate::hypervisor::mac_for_vm(vm_id)
    }

    pub async fn create(
        &self,
        cpu: u32,
        mem_mb: u32,
        allow_ips: Vec<String>,
        outbound_internet: bool,
        snapshot_id: Option<String>,
        image_id: Option<String>,
        disk_size_mb: Option<u64>,
    ) -> CoreResult<VmRecord> {
        self.validate_quotas(cpu, mem_mb, &allow_ips)?;
        let active = self.store.count_active().await?;
        if active >= self.config.max_vms as usize {
            return Err(CoreError::conflict(format!(
                "active vm count {active} reached max {}",
                self.config.max_vms
            )));
        }

        let vm_id = Uuid::new_v4();
        let allocation = self.ip_allocator.allocate()?;
        let vsock_cid = self.cid_allocator.allocate();

        let (kernel_src, base_rootfs) = self.base_image_paths(image_id.as_deref());
        let base_meta = tokio::fs::metadata(&base_rootfs)
            .await
            .map_err(|e| CoreError::StorageFailure(format!("base rootfs {base_rootfs}: {e}")))?;
        let disk_size_mb = self.validate_disk_size(disk_size_mb, base_meta.len())?;
        let disk_size_bytes = disk_size_mb * 1024 * 1024;

        let restore_from_snapshot = snapshot_id.clone();
        let prepared = self.storage.vm_paths(vm_id);

        let now = chrono::Utc::now();
        let mut vm = VmRecord {
            id: vm_id,
            created_at: now,
            updated_at: now,
            cpu,
            mem_mb,
            vsock_cid,
            tap_name: allocation.tap_name.clone(),
            guest_ip: allocation.guest_ip.clone(),
            outbound_internet,
            allow_ips,
            rootfs_path: prepared.rootfs_path,
            kernel_path: prepared.kernel_path,
            logs_dir: prepared.logs_dir,
            image_id,
            state: VmState::Created,
            provision_mode: None,
        };
        // Step 2: persist CREATED before step 3 can fail the create over an
        // unusable explicit snapshot — that failure still leaves a tombstone
        // ERROR record behind rather than nothing at all.
        self.store.create(&vm).await?;

        let result = self
            .provision_and_boot(&mut vm, restore_from_snapshot, &kernel_src, &base_rootfs, disk_size_bytes)
            .await;
        match result {
            Ok(()) => {
                self.activity.publish(vm.id, "vm.created", serde_json::json!({
                    "provisionMode": vm.provision_mode.map(|m| m.as_str()),
                }));
                Ok(vm)
            }
            Err(e) => {
                self.transition_error(vm.id, &e).await;
                Err(e)
            }
        }
    }

    /// Step 3 of create(): validate and materialize storage for the chosen
    /// provisioning source, then run the boot/restore state machine. Errors
    /// here leave the already-persisted `CREATED` record for `transition_error`
    /// to mark `ERROR` rather than failing before any record exists.
    async fn provision_and_boot(
        &self,
        vm: &mut VmRecord,
        snapshot_id: Option<String>,
        kernel_src: &str,
        base_rootfs: &str,
        disk_size_bytes: u64,
    ) -> CoreResult<()> {
        if let Some(snap_id) = &snapshot_id {
            let meta = self.store.get_snapshot_meta(snap_id).await?;
            if !meta.has_disk {
                return Err(CoreError::conflict(format!("snapshot {snap_id} has no disk")));
            }
            if meta.cpu != vm.cpu || meta.mem_mb != vm.mem_mb {
                return Err(CoreError::conflict(format!(
                    "snapshot {snap_id} cpu/memMb mismatch: snapshot={}/{} requested={}/{}",
                    meta.cpu, meta.mem_mb, vm.cpu, vm.mem_mb
                )));
            }
            let paths = self.storage.get_snapshot_artifact_paths(snap_id);
            if !self.storage.snapshot_artifacts_exist(&paths, true).await {
                return Err(CoreError::not_found(format!(
                    "snapshot {snap_id} artifacts missing on disk"
                )));
            }
            self.storage
                .prepare_vm_storage_from_disk(vm.id, kernel_src, &paths.disk_path, Some(disk_size_bytes))
                .await?;
        } else {
            self.storage
                .prepare_vm_storage(vm.id, kernel_src, base_rootfs, Some(disk_size_bytes))
                .await?;
        }

        self.boot_vm(vm, snapshot_id).await
    }

    async fn cold_boot(&self, vm: &mut VmRecord) -> CoreResult<()> {
        let tap_name = vm.tap_name.clone();
        let rootfs_path = vm.rootfs_path.clone();
        let kernel_path = vm.kernel_path.clone();
        self.network
            .configure(vm, &tap_name, ConfigureOptions { up: true })
            .await?;
        let pid = self
            .hypervisor
            .create_and_start(vm, &rootfs_path, &kernel_path, &tap_name)
            .await?;
        self.record_pid(vm.id, pid).await;
        self.start_barrier(vm, pid).await
    }

    /// Restores from an existing snapshot's artifacts. Leaves `vm` in the
    /// STARTING health+allowlist barrier on success; the caller still owns
    /// setting `provisionMode`/finalizing to RUNNING.
    async fn restore_boot(&self, vm: &mut VmRecord, paths: &crate::model::SnapshotArtifactPaths) -> CoreResult<()> {
        let tap_name = vm.tap_name.clone();
        let rootfs_path = vm.rootfs_path.clone();
        let kernel_path = vm.kernel_path.clone();
        self.network
            .configure(vm, &tap_name, ConfigureOptions { up: false })
            .await?;
        let pid = self
            .hypervisor
            .restore_from_snapshot(vm, &rootfs_path, &kernel_path, &tap_name, &paths.mem_path, &paths.state_path)
            .await?;
        self.finish_restore(vm, pid).await
    }

    /// Step 3-5 of create(): decide boot vs restore, configure network,
    /// launch, then the STARTING -> RUNNING health+allowlist barrier.
    async fn boot_vm(&self, vm: &mut VmRecord, snapshot_id: Option<String>) -> CoreResult<()> {
        let template_match = snapshot_id.is_none()
            && self.config.enable_snapshots
            && vm.cpu == self.config.snapshot_template_cpu
            && vm.mem_mb == self.config.snapshot_template_mem_mb;

        if let Some(snap_id) = snapshot_id {
            let paths = self.storage.get_snapshot_artifact_paths(&snap_id);
            self.restore_boot(vm, &paths).await?;
            return self.finalize_running(vm, ProvisionMode::Snapshot).await;
        }

        if template_match {
            if let Some(template_id) = self.template_snapshot_id_if_exists().await {
                let paths = self.storage.get_snapshot_artifact_paths(&template_id);
                if self.storage.snapshot_artifacts_exist(&paths, false).await {
                    match self.restore_boot(vm, &paths).await {
                        Ok(()) => return self.finalize_running(vm, ProvisionMode::Snapshot).await,
                        Err(e) => {
                            warn!(vm_id = %vm.id, error = %e, "template restore failed, falling back to cold boot");
                            if let Some(pid) = self.pids.lock().await.remove(&vm.id) {
                                let jail_root = vm.jail_root(&self.config.chroot_base);
                                let _ = self.hypervisor.destroy(pid, &jail_root).await;
                            }
                        }
                    }
                }
            }
        }

        self.cold_boot(vm).await?;
        self.finalize_running(vm, ProvisionMode::Boot).await
    }

    async fn finish_restore(&self, vm: &mut VmRecord, pid: u32) -> CoreResult<()> {
        self.record_pid(vm.id, pid).await;
        self.vsock
            .configure_network(
                &self.config.chroot_base,
                &vm.id,
                self.config.agent_port,
                &ConfigureNetworkBody {
                    iface: "eth0".into(),
                    ip: vm.guest_ip.clone(),
                    cidr: 24,
                    gateway: self.config.gateway_ip.clone(),
                    mac: Self::mac_for(&vm.id),
                    dns: None,
                    dns_only: false,
                },
            )
            .await?;
        self.network.bring_up_tap(&vm.tap_name).await?;
        self.start_barrier(vm, pid).await
    }

    async fn start_barrier(&self, vm: &mut VmRecord, _pid: u32) -> CoreResult<()> {
        vm.state = VmState::Starting;
        self.store.update(vm.id, |r| r.state = VmState::Starting).await?;
        self.vsock.health(&self.config.chroot_base, &vm.id, self.config.agent_port).await?;
        self.vsock
            .apply_allowlist(&self.config.chroot_base, &vm.id, self.config.agent_port, vm.outbound_internet, &vm.allow_ips)
            .await?;
        Ok(())
    }

    async fn finalize_running(&self, vm: &mut VmRecord, provision_mode: ProvisionMode) -> CoreResult<()> {
        vm.state = VmState::Running;
        vm.provision_mode = Some(provision_mode);
        self.store
            .update(vm.id, |r| {
                r.state = VmState::Running;
                r.provision_mode = Some(provision_mode);
            })
            .await?;
        metrics::counter!("sandboxd_vm_started_total").increment(1);
        Ok(())
    }

    async fn template_snapshot_id_if_exists(&self) -> Option<String> {
        let (kernel_src, base_rootfs) = self.base_image_paths(None);
        let kernel_bytes = tokio::fs::read(&kernel_src).await.ok()?;
        let rootfs_bytes = tokio::fs::read(&base_rootfs).await.ok()?;
        Some(template_snapshot_id(&kernel_bytes, &rootfs_bytes))
    }

    async fn record_pid(&self, id: Uuid, pid: u32) {
        self.pids.lock().await.insert(id, pid);
    }

    async fn transition_error(&self, id: Uuid, err: &CoreError) {
        let _ = self.store.update(id, |r| r.state = VmState::Error).await;
        self.activity
            .publish(id, "vm.error", serde_json::json!({"error": err.to_string()}));
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<VmRecord> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> CoreResult<Vec<VmRecord>> {
        self.store.list().await
    }

    pub async fn start(&self, id: Uuid) -> CoreResult<VmRecord> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut vm = self.store.get(id).await?;
        if vm.state == VmState::Running {
            return Ok(vm);
        }
        self.network
            .configure(&vm, &vm.tap_name, ConfigureOptions { up: true })
            .await?;
        let result: CoreResult<()> = async {
            let pid = self
                .hypervisor
                .create_and_start(&vm, &vm.rootfs_path, &vm.kernel_path, &vm.tap_name)
                .await?;
            self.record_pid(id, pid).await;
            self.start_barrier(&mut vm, pid).await?;
            self.finalize_running(&mut vm, ProvisionMode::Boot).await
        }
        .await;

        match result {
            Ok(()) => {
                self.activity.publish(id, "vm.started", serde_json::json!({}));
                Ok(vm)
            }
            Err(e) => {
                self.transition_error(id, &e).await;
                Err(e)
            }
        }
    }

    pub async fn stop(&self, id: Uuid) -> CoreResult<VmRecord> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let vm = self.store.update(id, |r| r.state = VmState::Stopping).await?;
        if let Some(pid) = self.pids.lock().await.remove(&id) {
            self.hypervisor.stop(pid).await?;
        }
        let warnings = self.network.teardown(&vm, &vm.tap_name).await;
        let vm = self.store.update(id, |r| r.state = VmState::Stopped).await?;
        self.activity
            .publish(id, "vm.stopped", serde_json::json!({"warnings": warnings}));
        Ok(vm)
    }

    pub async fn destroy(&self, id: Uuid) -> CoreResult<VmRecord> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let vm = self.store.get(id).await?;
        let mut warnings = Vec::new();

        if let Some(pid) = self.pids.lock().await.remove(&id) {
            let jail_root = vm.jail_root(&self.config.chroot_base);
            warnings.extend(self.hypervisor.destroy(pid, &jail_root).await);
        }
        warnings.extend(self.network.teardown(&vm, &vm.tap_name).await);
        match self.storage.cleanup_vm_storage(vm.id).await {
            Ok(mut w) => warnings.append(&mut w),
            Err(e) => warnings.push(format!("storage cleanup: {e}")),
        }

        self.store.delete(id).await?;
        let deleted = self.store.get(id).await.unwrap_or(VmRecord { state: VmState::Deleted, ..vm });
        self.activity
            .publish(id, "vm.destroyed", serde_json::json!({"warnings": warnings}));
        Ok(deleted)
    }

    pub async fn exec(
        &self,
        id: Uuid,
        body: &crate::vsock::ExecBody,
    ) -> CoreResult<crate::vsock::ExecResult> {
        let vm = self.store.get(id).await?;
        self.require_running(&vm)?;
        let clamped = clamp_timeout(body.timeout_ms, self.config.max_exec_timeout_ms);
        let mut body = body.clone();
        body.timeout_ms = Some(clamped);
        self.vsock
            .exec(&self.config.chroot_base, &vm.id, self.config.agent_port, self.config.vsock.timeout_ms, &body)
            .await
    }

    pub async fn run_ts(
        &self,
        id: Uuid,
        body: &crate::vsock::RunTsBody,
    ) -> CoreResult<crate::vsock::ExecResult> {
        let vm = self.store.get(id).await?;
        self.require_running(&vm)?;
        let clamped = clamp_timeout(body.timeout_ms, self.config.max_run_ts_timeout_ms);
        let mut body = body.clone();
        body.timeout_ms = Some(clamped);
        self.vsock
            .run_ts(&self.config.chroot_base, &vm.id, self.config.agent_port, self.config.vsock.timeout_ms, &body)
            .await
    }

    pub async fn upload(&self, id: Uuid, dest: &str, data: Vec<u8>) -> CoreResult<()> {
        let vm = self.store.get(id).await?;
        self.require_running(&vm)?;
        self.vsock
            .upload(&self.config.chroot_base, &vm.id, self.config.agent_port, dest, data)
            .await
    }

    pub async fn download(&self, id: Uuid, path: &str) -> CoreResult<Vec<u8>> {
        let vm = self.store.get(id).await?;
        self.require_running(&vm)?;
        self.vsock
            .download(&self.config.chroot_base, &vm.id, self.config.agent_port, path)
            .await
    }

    fn require_running(&self, vm: &VmRecord) -> CoreResult<()> {
        if vm.state != VmState::Running {
            return Err(CoreError::conflict(format!(
                "vm {} is not running (state={})",
                vm.id,
                vm.state.as_str()
            )));
        }
        Ok(())
    }

    pub async fn create_snapshot(&self, id: Uuid, image_id: Option<String>) -> CoreResult<SnapshotMeta> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let vm = self.store.get(id).await?;
        self.require_running(&vm)?;

        // Best-effort filesystem quiesce before freezing the guest.
        let _ = self
            .vsock
            .exec(
                &self.config.chroot_base,
                &vm.id,
                self.config.agent_port,
                self.config.vsock.timeout_ms,
                &crate::vsock::ExecBody { cmd: "sync".into(), cwd: None, env: None, timeout_ms: None },
            )
            .await;

        let snapshot_id = Uuid::new_v4().to_string();
        let paths = self.storage.get_snapshot_artifact_paths(&snapshot_id);
        self.storage.ensure_snapshot_dir(&paths).await?;

        let jail_root = vm.jail_root(&self.config.chroot_base);
        self.hypervisor
            .create_snapshot(&jail_root, &paths.mem_path, &paths.state_path)
            .await?;
        self.storage.clone_disk(&vm.rootfs_path, &paths.disk_path).await?;

        let meta = SnapshotMeta {
            id: snapshot_id,
            kind: sandbox_types::SnapshotKind::Vm,
            created_at: chrono::Utc::now(),
            cpu: vm.cpu,
            mem_mb: vm.mem_mb,
            image_id,
            source_vm_id: Some(vm.id),
            has_disk: true,
        };
        self.store.create_snapshot_meta(&meta).await?;
        let meta_json = serde_json::json!({
            "kind": meta.kind.as_str(),
            "cpu": meta.cpu,
            "memMb": meta.mem_mb,
            "imageId": meta.image_id,
            "sourceVmId": meta.source_vm_id,
            "hasDisk": meta.has_disk,
        });
        self.storage.write_snapshot_meta_json(&meta.id, &meta_json).await?;

        self.activity
            .publish(vm.id, "vm.snapshotted", serde_json::json!({"snapshotId": meta.id}));
        Ok(meta)
    }

    /// Backs the `snapshot-build` CLI entrypoint (spec §6): cold-boot a
    /// throwaway VM at the configured template cpu/memMb, snapshot it with
    /// no disk (template snapshots reuse the base rootfs at restore time),
    /// and tear the VM down. The id is content-addressed (spec §4.6), so a
    /// rerun against an unchanged base image is a no-op.
    pub async fn build_template_snapshot(&self) -> CoreResult<SnapshotMeta> {
        let (kernel_src, base_rootfs) = self.base_image_paths(None);
        let kernel_bytes = tokio::fs::read(&kernel_src)
            .await
            .map_err(|e| CoreError::StorageFailure(format!("kernel {kernel_src}: {e}")))?;
        let rootfs_bytes = tokio::fs::read(&base_rootfs)
            .await
            .map_err(|e| CoreError::StorageFailure(format!("base rootfs {base_rootfs}: {e}")))?;
        let snapshot_id = template_snapshot_id(&kernel_bytes, &rootfs_bytes);

        if let Ok(existing) = self.store.get_snapshot_meta(&snapshot_id).await {
            info!(snapshot_id = %snapshot_id, "template snapshot already up to date");
            return Ok(existing);
        }

        let vm = self
            .create(
                self.config.snapshot_template_cpu,
                self.config.snapshot_template_mem_mb,
                Vec::new(),
                false,
                None,
                None,
                None,
            )
            .await?;

        let build_result = self.snapshot_template_from(&vm, &snapshot_id).await;

        // Best-effort: the throwaway VM is scaffolding, not a caller's
        // resource, so its teardown failing doesn't fail the build.
        if let Err(e) = self.destroy(vm.id).await {
            warn!(vm_id = %vm.id, error = %e, "failed to tear down template-build vm");
        }

        build_result
    }

    async fn snapshot_template_from(&self, vm: &VmRecord, snapshot_id: &str) -> CoreResult<SnapshotMeta> {
        let paths = self.storage.get_snapshot_artifact_paths(snapshot_id);
        self.storage.ensure_snapshot_dir(&paths).await?;

        let jail_root = vm.jail_root(&self.config.chroot_base);
        self.hypervisor
            .create_snapshot(&jail_root, &paths.mem_path, &paths.state_path)
            .await?;

        let meta = SnapshotMeta {
            id: snapshot_id.to_string(),
            kind: sandbox_types::SnapshotKind::Template,
            created_at: chrono::Utc::now(),
            cpu: vm.cpu,
            mem_mb: vm.mem_mb,
            image_id: None,
            source_vm_id: None,
            has_disk: false,
        };
        self.store.create_snapshot_meta(&meta).await?;
        let meta_json = serde_json::json!({
            "kind": meta.kind.as_str(),
            "cpu": meta.cpu,
            "memMb": meta.mem_mb,
            "imageId": meta.image_id,
            "sourceVmId": meta.source_vm_id,
            "hasDisk": meta.has_disk,
        });
        self.storage.write_snapshot_meta_json(&meta.id, &meta_json).await?;
        Ok(meta)
    }
}

fn clamp_timeout(requested: Option<u64>, max: u64) -> u64 {
    requested.map(|v| v.min(max)).unwrap_or(max)
}

fn is_valid_cidr_or_ip(s: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"^(\d{1,3}\.){3}\d{1,3}(/\d{1,2})?$").unwrap()
    });
    re.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_ip_validation_accepts_plain_and_cidr() {
        assert!(is_valid_cidr_or_ip("1.2.3.4"));
        assert!(is_valid_cidr_or_ip("1.2.3.4/32"));
        assert!(!is_valid_cidr_or_ip("not-an-ip"));
        assert!(!is_valid_cidr_or_ip("1.2.3.4/"));
    }

    #[test]
    fn clamp_timeout_uses_max_when_unset_and_caps_when_over() {
        assert_eq!(clamp_timeout(None, 60_000), 60_000);
        assert_eq!(clamp_timeout(Some(1_000), 60_000), 1_000);
        assert_eq!(clamp_timeout(Some(120_000), 60_000), 60_000);
    }

    #[test]
    fn cid_allocator_seeds_above_max_observed() {
        let alloc = CidAllocator::new();
        alloc.seed_above(&[5002, 5005]);
        assert_eq!(alloc.allocate(), 5006);
    }
}
