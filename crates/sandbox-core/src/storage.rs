//! Storage Provider (spec §4.1). Generalizes
//! `features/storage::LocalStorage` (env-configured base path,
//! `vm_dir`/`ensure_vm_dirs`/`cleanup_vm`) to per-VM chroot layout with
//! rootfs cloning and ext4 growth.

use std::sync::Arc;
use uuid::Uuid;

use crate::config::RootfsCloneMode;
use crate::error::{CoreError, CoreResult};
use crate::host_actions::HostActions;
use crate::model::SnapshotArtifactPaths;

#[derive(Clone)]
pub struct StorageProvider {
    chroot_base: String,
    storage_root: String,
    clone_mode: RootfsCloneMode,
    host: Arc<dyn HostActions>,
}

#[derive(Clone)]
pub struct PreparedStorage {
    pub rootfs_path: String,
    pub kernel_path: String,
    pub logs_dir: String,
}

impl StorageProvider {
    pub fn new(
        chroot_base: impl Into<String>,
        storage_root: impl Into<String>,
        clone_mode: RootfsCloneMode,
        host: Arc<dyn HostActions>,
    ) -> Self {
        Self {
            chroot_base: chroot_base.into(),
            storage_root: storage_root.into(),
            clone_mode,
            host,
        }
    }

    fn jail_root(&self, vm_id: Uuid) -> String {
        format!("{}/{vm_id}", self.chroot_base)
    }

    /// Deterministic per-VM path layout, derivable from `vm_id` alone with
    /// no I/O. Used to populate a `VmRecord` before its storage has actually
    /// been laid out on disk (spec §4.5 step 2 persists `CREATED` before
    /// step 3's snapshot-precondition checks can fail the create).
    pub fn vm_paths(&self, vm_id: Uuid) -> PreparedStorage {
        let jail_root = self.jail_root(vm_id);
        PreparedStorage {
            rootfs_path: format!("{jail_root}/rootfs.ext4"),
            kernel_path: format!("{jail_root}/vmlinux"),
            logs_dir: format!("{jail_root}/logs"),
        }
    }

    pub async fn prepare_vm_storage(
        &self,
        vm_id: Uuid,
        kernel_src: &str,
        base_rootfs: &str,
        disk_size_bytes: Option<u64>,
    ) -> CoreResult<PreparedStorage> {
        let jail_root = self.jail_root(vm_id);
        let paths = self.vm_paths(vm_id);
        tokio::fs::create_dir_all(&paths.logs_dir).await?;
        tokio::fs::create_dir_all(format!("{jail_root}/run")).await?;

        tokio::fs::copy(kernel_src, &paths.kernel_path).await?;
        self.clone_rootfs(base_rootfs, &paths.rootfs_path).await?;

        if let Some(size) = disk_size_bytes {
            self.grow_if_needed(&paths.rootfs_path, size).await?;
        }

        self.chmod_owner_group_rw(&paths.rootfs_path).await?;

        Ok(paths)
    }

    pub async fn prepare_vm_storage_from_disk(
        &self,
        vm_id: Uuid,
        kernel_src: &str,
        disk_src: &str,
        disk_size_bytes: Option<u64>,
    ) -> CoreResult<PreparedStorage> {
        // Same layout as prepare_vm_storage, but the root disk is a snapshot's
        // preserved disk image rather than the base image.
        self.prepare_vm_storage(vm_id, kernel_src, disk_src, disk_size_bytes)
            .await
    }

    async fn clone_rootfs(&self, src: &str, dest: &str) -> CoreResult<()> {
        self.host
            .clone_file_reflink_or_copy(src, dest, self.clone_mode)
            .await
    }

    async fn grow_if_needed(&self, path: &str, size_bytes: u64) -> CoreResult<()> {
        let meta = tokio::fs::metadata(path).await?;
        if size_bytes > meta.len() {
            self.host.grow_ext4_to_size(path, size_bytes).await?;
        }
        Ok(())
    }

    async fn chmod_owner_group_rw(&self, path: &str) -> CoreResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(path).await?.permissions();
            perms.set_mode(0o660);
            tokio::fs::set_permissions(path, perms).await?;
        }
        Ok(())
    }

    pub async fn cleanup_vm_storage(&self, vm_id: Uuid) -> CoreResult<Vec<String>> {
        let mut warnings = Vec::new();
        let jail_root = self.jail_root(vm_id);
        if let Err(e) = tokio::fs::remove_dir_all(&jail_root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warnings.push(format!("cleanup jail root {jail_root}: {e}"));
            }
        }
        Ok(warnings)
    }

    pub fn get_snapshot_artifact_paths(&self, snapshot_id: &str) -> SnapshotArtifactPaths {
        SnapshotArtifactPaths::new(&self.storage_root, snapshot_id)
    }

    pub async fn ensure_snapshot_dir(&self, paths: &SnapshotArtifactPaths) -> CoreResult<()> {
        tokio::fs::create_dir_all(&paths.dir).await?;
        Ok(())
    }

    pub async fn clone_disk(&self, src: &str, dest: &str) -> CoreResult<()> {
        self.host
            .clone_file_reflink_or_copy(src, dest, self.clone_mode)
            .await
    }

    pub async fn list_snapshots(&self) -> CoreResult<Vec<String>> {
        let dir = format!("{}/snapshots", self.storage_root);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    pub async fn read_snapshot_meta_json(&self, snapshot_id: &str) -> CoreResult<serde_json::Value> {
        let paths = self.get_snapshot_artifact_paths(snapshot_id);
        let bytes = tokio::fs::read(&paths.meta_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!("snapshot meta {snapshot_id} not found"))
            } else {
                CoreError::StorageFailure(e.to_string())
            }
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::StorageFailure(format!("invalid snapshot meta.json: {e}")))
    }

    pub async fn write_snapshot_meta_json(
        &self,
        snapshot_id: &str,
        meta: &serde_json::Value,
    ) -> CoreResult<()> {
        let paths = self.get_snapshot_artifact_paths(snapshot_id);
        tokio::fs::write(&paths.meta_path, serde_json::to_vec_pretty(meta).unwrap()).await?;
        Ok(())
    }

    pub async fn snapshot_artifacts_exist(&self, paths: &SnapshotArtifactPaths, has_disk: bool) -> bool {
        let mem_ok = tokio::fs::metadata(&paths.mem_path).await.is_ok();
        let state_ok = tokio::fs::metadata(&paths.state_path).await.is_ok();
        let disk_ok = !has_disk || tokio::fs::metadata(&paths.disk_path).await.is_ok();
        mem_ok && state_ok && disk_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_actions::RecordingHostActions;

    #[tokio::test]
    async fn prepare_vm_storage_lays_out_jail_root() {
        let tmp = tempfile::tempdir().unwrap();
        let chroot_base = tmp.path().join("jails");
        let storage_root = tmp.path().join("storage");
        let base_rootfs = tmp.path().join("base.ext4");
        let kernel = tmp.path().join("vmlinux-src");
        tokio::fs::write(&base_rootfs, b"rootfs-bytes").await.unwrap();
        tokio::fs::write(&kernel, b"kernel-bytes").await.unwrap();

        let host = Arc::new(RecordingHostActions::default());
        let provider = StorageProvider::new(
            chroot_base.to_str().unwrap(),
            storage_root.to_str().unwrap(),
            RootfsCloneMode::Auto,
            host.clone(),
        );

        let vm_id = Uuid::new_v4();
        let prepared = provider
            .prepare_vm_storage(vm_id, kernel.to_str().unwrap(), base_rootfs.to_str().unwrap(), None)
            .await
            .unwrap();

        assert!(prepared.rootfs_path.ends_with("rootfs.ext4"));
        assert!(tokio::fs::metadata(&prepared.kernel_path).await.is_ok());
        assert!(host
            .calls_snapshot()
            .iter()
            .any(|c| c.starts_with("clone_file_reflink_or_copy")));
    }

    #[tokio::test]
    async fn cleanup_is_best_effort_for_missing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let host = Arc::new(RecordingHostActions::default());
        let provider = StorageProvider::new(
            tmp.path().join("jails").to_str().unwrap(),
            tmp.path().join("storage").to_str().unwrap(),
            RootfsCloneMode::Auto,
            host,
        );
        let warnings = provider.cleanup_vm_storage(Uuid::new_v4()).await.unwrap();
        assert!(warnings.is_empty());
    }
}
