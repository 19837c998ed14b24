//! The narrow subprocess capability boundary called out in spec §9's
//! "Ambient subprocess toolchain" redesign flag. Every place Storage,
//! Network and Hypervisor need to touch the host (`ip`, `iptables`, `tar`,
//! `e2fsck`/`resize2fs`, `cp --reflink=auto`, the jailer) goes through this
//! trait instead of shelling out directly, so tests substitute
//! `RecordingHostActions` for the real one — the async generalization of
//! the `#[cfg(test)]` in-memory swap for `vms::repo`.
//!
//! The real implementation is grounded directly in
//! `apps/agent/src/core/net.rs` (`ensure_bridge`, `create_tap_with_vlan`,
//! `delete_tap`, `add_port_forward`'s check-then-insert idiom) and
//! `core/systemd.rs` (`spawn_fc_scope`'s `tokio::process::Command` spawn +
//! bounded-retry socket wait).

use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::RootfsCloneMode;
use crate::error::{CoreError, CoreResult};

/// One ordered egress rule inside a per-VM chain (spec §4.2).
#[derive(Debug, Clone)]
pub enum ChainRule {
    AcceptEstablishedRelated,
    AcceptDest(String),
    Drop,
}

#[derive(Debug, Clone)]
pub struct HypervisorLaunchConfig {
    pub jail_root: String,
    pub uid: u32,
    pub gid: u32,
    pub vm_id: String,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub tap_name: String,
    pub mac: String,
    pub vcpu: u32,
    pub mem_mb: u32,
    pub vsock_cid: u32,
    pub uds_path: String,
    pub api_sock_path: String,
    pub log_path: String,
    pub restore: Option<(String, String)>, // (mem_path, state_path)
}

#[async_trait]
pub trait HostActions: Send + Sync {
    async fn ensure_bridge(&self, bridge: &str, gateway_cidr: &str) -> CoreResult<()>;
    async fn delete_tap_if_exists(&self, tap: &str) -> CoreResult<()>;
    async fn create_tap(&self, tap: &str) -> CoreResult<()>;
    async fn attach_to_bridge(&self, tap: &str, bridge: &str) -> CoreResult<()>;
    async fn set_link_up(&self, iface: &str) -> CoreResult<()>;
    async fn delete_tap(&self, tap: &str) -> CoreResult<()>;
    async fn ensure_nat_masquerade(&self, subnet_cidr: &str) -> CoreResult<()>;
    async fn ensure_per_vm_chain(
        &self,
        chain: &str,
        bridge: &str,
        guest_ip: &str,
        rules: &[ChainRule],
    ) -> CoreResult<()>;
    async fn delete_chain_jumps(&self, chain: &str, bridge: &str, guest_ip: &str) -> CoreResult<()>;

    async fn extract_tar_gz(&self, archive_path: &str, dest_dir: &str) -> CoreResult<()>;
    async fn grow_ext4_to_size(&self, path: &str, size_bytes: u64) -> CoreResult<()>;
    async fn clone_file_reflink_or_copy(
        &self,
        src: &str,
        dest: &str,
        mode: RootfsCloneMode,
    ) -> CoreResult<()>;

    async fn spawn_hypervisor(&self, config: &HypervisorLaunchConfig) -> CoreResult<u32>;
    async fn signal_process(&self, pid: u32, signal: &str) -> CoreResult<()>;
    async fn process_alive(&self, pid: u32) -> bool;
}

/// Real host actions: every mutation is a `tokio::process::Command`
/// invocation, idempotent where required (check with `-C`
/// / `ip link show` before mutating).
pub struct SystemHostActions;

fn sub_err(context: &str, output: std::process::Output) -> CoreError {
    CoreError::SubprocessFailure(format!(
        "{context}: exit={:?} stderr={}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

#[async_trait]
impl HostActions for SystemHostActions {
    async fn ensure_bridge(&self, bridge: &str, gateway_cidr: &str) -> CoreResult<()> {
        let exists = Command::new("ip")
            .args(["link", "show", bridge])
            .output()
            .await?
            .status
            .success();
        if !exists {
            let out = Command::new("sudo")
                .args(["-n", "ip", "link", "add", bridge, "type", "bridge"])
                .output()
                .await?;
            if !out.status.success() {
                return Err(sub_err("ip link add bridge", out));
            }
            let out = Command::new("sudo")
                .args(["-n", "ip", "addr", "add", gateway_cidr, "dev", bridge])
                .output()
                .await?;
            if !out.status.success() {
                return Err(sub_err("ip addr add gateway", out));
            }
        }
        let out = Command::new("sudo")
            .args(["-n", "ip", "link", "set", bridge, "up"])
            .output()
            .await?;
        if !out.status.success() {
            return Err(sub_err("ip link set bridge up", out));
        }
        Ok(())
    }

    async fn delete_tap_if_exists(&self, tap: &str) -> CoreResult<()> {
        let exists = Command::new("ip")
            .args(["link", "show", tap])
            .output()
            .await?
            .status
            .success();
        if exists {
            self.delete_tap(tap).await?;
        }
        Ok(())
    }

    async fn create_tap(&self, tap: &str) -> CoreResult<()> {
        let out = Command::new("sudo")
            .args(["-n", "ip", "tuntap", "add", "dev", tap, "mode", "tap"])
            .output()
            .await?;
        if !out.status.success() {
            return Err(sub_err("ip tuntap add", out));
        }
        Ok(())
    }

    async fn attach_to_bridge(&self, tap: &str, bridge: &str) -> CoreResult<()> {
        let out = Command::new("sudo")
            .args(["-n", "ip", "link", "set", tap, "master", bridge])
            .output()
            .await?;
        if !out.status.success() {
            return Err(sub_err("ip link set master", out));
        }
        Ok(())
    }

    async fn set_link_up(&self, iface: &str) -> CoreResult<()> {
        let out = Command::new("sudo")
            .args(["-n", "ip", "link", "set", iface, "up"])
            .output()
            .await?;
        if !out.status.success() {
            return Err(sub_err("ip link set up", out));
        }
        Ok(())
    }

    async fn delete_tap(&self, tap: &str) -> CoreResult<()> {
        let out = Command::new("sudo")
            .args(["-n", "ip", "link", "del", tap])
            .output()
            .await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        let stderr = stderr.trim();
        if stderr.contains("Cannot find device") || stderr.contains("does not exist") || stderr.is_empty() {
            return Ok(());
        }
        Err(sub_err("ip link del tap", out))
    }

    async fn ensure_nat_masquerade(&self, subnet_cidr: &str) -> CoreResult<()> {
        let check = Command::new("sudo")
            .args([
                "-n", "iptables", "-t", "nat", "-C", "POSTROUTING", "-s", subnet_cidr, "-j",
                "MASQUERADE",
            ])
            .output()
            .await?;
        if check.status.success() {
            return Ok(());
        }
        let out = Command::new("sudo")
            .args([
                "-n", "iptables", "-t", "nat", "-A", "POSTROUTING", "-s", subnet_cidr, "-j",
                "MASQUERADE",
            ])
            .output()
            .await?;
        if !out.status.success() {
            return Err(sub_err("iptables add masquerade", out));
        }
        Ok(())
    }

    async fn ensure_per_vm_chain(
        &self,
        chain: &str,
        bridge: &str,
        guest_ip: &str,
        rules: &[ChainRule],
    ) -> CoreResult<()> {
        let new_chain = Command::new("sudo")
            .args(["-n", "iptables", "-N", chain])
            .output()
            .await?;
        let _ = new_chain; // EEXIST is fine — chain already present

        let flush = Command::new("sudo")
            .args(["-n", "iptables", "-F", chain])
            .output()
            .await?;
        if !flush.status.success() {
            return Err(sub_err("iptables flush chain", flush));
        }

        for rule in rules {
            let args: Vec<String> = match rule {
                ChainRule::AcceptEstablishedRelated => vec![
                    "-A".into(), chain.into(), "-m".into(), "conntrack".into(), "--ctstate".into(),
                    "ESTABLISHED,RELATED".into(), "-j".into(), "ACCEPT".into(),
                ],
                ChainRule::AcceptDest(dest) => vec![
                    "-A".into(), chain.into(), "-d".into(), dest.clone(), "-j".into(), "ACCEPT".into(),
                ],
                ChainRule::Drop => vec!["-A".into(), chain.into(), "-j".into(), "DROP".into()],
            };
            let out = Command::new("sudo")
                .arg("-n")
                .arg("iptables")
                .args(&args)
                .output()
                .await?;
            if !out.status.success() {
                return Err(sub_err("iptables append rule", out));
            }
        }

        for parent in ["INPUT", "FORWARD"] {
            let check = Command::new("sudo")
                .args([
                    "-n", "iptables", "-C", parent, "-i", bridge, "-s", guest_ip, "-j", chain,
                ])
                .output()
                .await?;
            if !check.status.success() {
                let out = Command::new("sudo")
                    .args([
                        "-n", "iptables", "-I", parent, "1", "-i", bridge, "-s", guest_ip, "-j",
                        chain,
                    ])
                    .output()
                    .await?;
                if !out.status.success() {
                    return Err(sub_err("iptables insert jump", out));
                }
            }
        }
        Ok(())
    }

    async fn delete_chain_jumps(&self, chain: &str, bridge: &str, guest_ip: &str) -> CoreResult<()> {
        for parent in ["INPUT", "FORWARD"] {
            let _ = Command::new("sudo")
                .args([
                    "-n", "iptables", "-D", parent, "-i", bridge, "-s", guest_ip, "-j", chain,
                ])
                .output()
                .await;
        }
        let _ = Command::new("sudo").args(["-n", "iptables", "-F", chain]).output().await;
        let _ = Command::new("sudo").args(["-n", "iptables", "-X", chain]).output().await;
        Ok(())
    }

    async fn extract_tar_gz(&self, archive_path: &str, dest_dir: &str) -> CoreResult<()> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let out = Command::new("tar")
            .args(["-xzf", archive_path, "-C", dest_dir])
            .output()
            .await?;
        if !out.status.success() {
            return Err(sub_err("tar extract", out));
        }
        Ok(())
    }

    async fn grow_ext4_to_size(&self, path: &str, size_bytes: u64) -> CoreResult<()> {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size_bytes).await?;
        drop(file);

        let fsck = Command::new("e2fsck").args(["-f", "-y", path]).output().await?;
        // e2fsck exit codes 0/1 mean "clean"/"errors fixed", both acceptable here.
        if let Some(code) = fsck.status.code() {
            if code > 1 {
                return Err(sub_err("e2fsck", fsck));
            }
        }

        let out = Command::new("resize2fs").arg(path).output().await?;
        if !out.status.success() {
            return Err(sub_err("resize2fs", out));
        }
        Ok(())
    }

    async fn clone_file_reflink_or_copy(
        &self,
        src: &str,
        dest: &str,
        mode: RootfsCloneMode,
    ) -> CoreResult<()> {
        if let Some(parent) = Path::new(dest).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match mode {
            RootfsCloneMode::Copy => {
                tokio::fs::copy(src, dest).await?;
                Ok(())
            }
            RootfsCloneMode::Reflink => {
                let out = Command::new("cp")
                    .args(["--reflink=always", src, dest])
                    .output()
                    .await?;
                if !out.status.success() {
                    return Err(sub_err("cp --reflink=always", out));
                }
                Ok(())
            }
            RootfsCloneMode::Auto => {
                let out = Command::new("cp")
                    .args(["--reflink=auto", src, dest])
                    .output()
                    .await?;
                if !out.status.success() {
                    return Err(sub_err("cp --reflink=auto", out));
                }
                Ok(())
            }
        }
    }

    async fn spawn_hypervisor(&self, config: &HypervisorLaunchConfig) -> CoreResult<u32> {
        if let Some(parent) = Path::new(&config.log_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::metadata(&config.log_path).await.is_err() {
            let mut f = tokio::fs::File::create(&config.log_path).await?;
            f.flush().await?;
        }
        if let Some(parent) = Path::new(&config.uds_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::metadata(&config.uds_path).await.is_ok() {
            let _ = tokio::fs::remove_file(&config.uds_path).await;
        }

        let mut cmd = Command::new("jailer");
        cmd.args([
            "--id",
            &config.vm_id,
            "--uid",
            &config.uid.to_string(),
            "--gid",
            &config.gid.to_string(),
            "--chroot-base-dir",
            &config.jail_root,
            "--exec-file",
            "/usr/bin/hypervisor",
            "--",
            "--api-sock",
            &config.api_sock_path,
        ]);
        let child = cmd.spawn().map_err(|e| {
            CoreError::SubprocessFailure(format!("failed to spawn jailer: {e}"))
        })?;
        let pid = child.id().ok_or_else(|| {
            CoreError::SubprocessFailure("jailer exited before reporting a pid".into())
        })?;
        std::mem::forget(child); // supervised externally by pid from here on

        for _ in 0..160 {
            if tokio::fs::metadata(&config.uds_path).await.is_ok() {
                return Ok(pid);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        Err(CoreError::SubprocessFailure(format!(
            "hypervisor UDS did not appear at {}",
            config.uds_path
        )))
    }

    async fn signal_process(&self, pid: u32, signal: &str) -> CoreResult<()> {
        let out = Command::new("kill")
            .args([format!("-{signal}"), pid.to_string()])
            .output()
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if stderr.contains("No such process") {
                return Ok(());
            }
            return Err(sub_err("kill", out));
        }
        Ok(())
    }

    async fn process_alive(&self, pid: u32) -> bool {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Records every call instead of touching the host — used by the
/// orchestrator's unit tests (spec §8 scenarios S1/S2/S5/S6 and the
/// idempotence property in §8.5).
pub struct RecordingHostActions {
    pub calls: Mutex<Vec<String>>,
    pub fail_teardown: std::sync::atomic::AtomicBool,
}

impl Default for RecordingHostActions {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_teardown: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl RecordingHostActions {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls_snapshot(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostActions for RecordingHostActions {
    async fn ensure_bridge(&self, bridge: &str, _gateway_cidr: &str) -> CoreResult<()> {
        self.record(format!("ensure_bridge({bridge})"));
        Ok(())
    }
    async fn delete_tap_if_exists(&self, tap: &str) -> CoreResult<()> {
        self.record(format!("delete_tap_if_exists({tap})"));
        Ok(())
    }
    async fn create_tap(&self, tap: &str) -> CoreResult<()> {
        self.record(format!("create_tap({tap})"));
        Ok(())
    }
    async fn attach_to_bridge(&self, tap: &str, bridge: &str) -> CoreResult<()> {
        self.record(format!("attach_to_bridge({tap},{bridge})"));
        Ok(())
    }
    async fn set_link_up(&self, iface: &str) -> CoreResult<()> {
        self.record(format!("set_link_up({iface})"));
        Ok(())
    }
    async fn delete_tap(&self, tap: &str) -> CoreResult<()> {
        self.record(format!("delete_tap({tap})"));
        Ok(())
    }
    async fn ensure_nat_masquerade(&self, subnet_cidr: &str) -> CoreResult<()> {
        self.record(format!("ensure_nat_masquerade({subnet_cidr})"));
        Ok(())
    }
    async fn ensure_per_vm_chain(
        &self,
        chain: &str,
        bridge: &str,
        guest_ip: &str,
        rules: &[ChainRule],
    ) -> CoreResult<()> {
        self.record(format!(
            "ensure_per_vm_chain({chain},{bridge},{guest_ip},n_rules={})",
            rules.len()
        ));
        Ok(())
    }
    async fn delete_chain_jumps(&self, chain: &str, bridge: &str, guest_ip: &str) -> CoreResult<()> {
        if self.fail_teardown.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::SubprocessFailure("injected teardown failure".into()));
        }
        self.record(format!("delete_chain_jumps({chain},{bridge},{guest_ip})"));
        Ok(())
    }
    async fn extract_tar_gz(&self, archive_path: &str, dest_dir: &str) -> CoreResult<()> {
        self.record(format!("extract_tar_gz({archive_path},{dest_dir})"));
        Ok(())
    }
    async fn grow_ext4_to_size(&self, path: &str, size_bytes: u64) -> CoreResult<()> {
        self.record(format!("grow_ext4_to_size({path},{size_bytes})"));
        Ok(())
    }
    async fn clone_file_reflink_or_copy(
        &self,
        src: &str,
        dest: &str,
        _mode: RootfsCloneMode,
    ) -> CoreResult<()> {
        self.record(format!("clone_file_reflink_or_copy({src},{dest})"));
        if let Some(parent) = Path::new(dest).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, b"fake-clone").await?;
        Ok(())
    }
    async fn spawn_hypervisor(&self, config: &HypervisorLaunchConfig) -> CoreResult<u32> {
        self.record(format!("spawn_hypervisor({})", config.vm_id));
        if let Some(parent) = Path::new(&config.uds_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&config.uds_path, b"").await?;
        Ok(4242)
    }
    async fn signal_process(&self, pid: u32, signal: &str) -> CoreResult<()> {
        self.record(format!("signal_process({pid},{signal})"));
        Ok(())
    }
    async fn process_alive(&self, _pid: u32) -> bool {
        false
    }
}
