//! VmRecord / SnapshotMeta per spec §3.

use chrono::{DateTime, Utc};
use sandbox_types::{ProvisionMode, SnapshotKind, VmState};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct VmRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub cpu: u32,
    pub mem_mb: u32,
    pub vsock_cid: u32,
    pub tap_name: String,
    pub guest_ip: String,
    pub outbound_internet: bool,
    pub allow_ips: Vec<String>,

    pub rootfs_path: String,
    pub kernel_path: String,
    pub logs_dir: String,
    pub image_id: Option<String>,

    pub state: VmState,
    pub provision_mode: Option<ProvisionMode>,
}

impl VmRecord {
    /// Invariant 5: a RUNNING record implies a deterministic per-VM UDS path.
    pub fn vsock_uds_path(&self, chroot_base: &str) -> String {
        format!("{chroot_base}/{}/run/v.sock", self.id)
    }

    pub fn jail_root(&self, chroot_base: &str) -> String {
        format!("{chroot_base}/{}", self.id)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub id: String,
    pub kind: SnapshotKind,
    pub created_at: DateTime<Utc>,
    pub cpu: u32,
    pub mem_mb: u32,
    pub image_id: Option<String>,
    pub source_vm_id: Option<Uuid>,
    pub has_disk: bool,
}

/// `<storageRoot>/snapshots/<id>/{mem.snap, vmstate.snap, disk.ext4, meta.json}`
#[derive(Debug, Clone)]
pub struct SnapshotArtifactPaths {
    pub dir: String,
    pub mem_path: String,
    pub state_path: String,
    pub disk_path: String,
    pub meta_path: String,
}

impl SnapshotArtifactPaths {
    pub fn new(storage_root: &str, snapshot_id: &str) -> Self {
        let dir = format!("{storage_root}/snapshots/{snapshot_id}");
        Self {
            mem_path: format!("{dir}/mem.snap"),
            state_path: format!("{dir}/vmstate.snap"),
            disk_path: format!("{dir}/disk.ext4"),
            meta_path: format!("{dir}/meta.json"),
            dir,
        }
    }
}
