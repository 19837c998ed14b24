//! Hypervisor Supervisor (spec §4.3). The jailer spawn + bounded UDS-wait
//! generalizes `core/systemd::spawn_fc_scope` +
//! `features/vm/spawn.rs`'s wait loop; machine configuration reuses the
//! `core/uds_proxy::forward` approach (a `hyper`/`hyperlocal`
//! client talking to the hypervisor's local control API over a UDS),
//! invoked in-process rather than proxied through an HTTP route.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use hyperlocal::UnixConnector;

use crate::error::{CoreError, CoreResult};
use crate::host_actions::{HostActions, HypervisorLaunchConfig};
use crate::model::VmRecord;

type UdsClient = Client<UnixConnector, Full<Bytes>>;

fn uds_client() -> UdsClient {
    Client::builder(TokioExecutor::new()).build(UnixConnector)
}

async fn api_request(
    client: &UdsClient,
    sock_path: &str,
    method: Method,
    path: &str,
    body: serde_json::Value,
) -> CoreResult<()> {
    let uri = hyperlocal::Uri::new(sock_path, path);
    let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Full::new(bytes))
        .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;

    let res = client
        .request(req)
        .await
        .map_err(|e| CoreError::SubprocessFailure(format!("hypervisor api request failed: {e}")))?;
    let status = res.status();
    let body = res
        .into_body()
        .collect()
        .await
        .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?
        .to_bytes();
    if !status.is_success() {
        return Err(CoreError::SubprocessFailure(format!(
            "hypervisor api {path} returned {status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }
    Ok(())
}

/// Deterministic locally-administered MAC derived from the VM id, so two
/// VMs never collide and the address is reproducible across restore.
pub fn mac_for_vm(vm_id: &uuid::Uuid) -> String {
    let bytes = vm_id.as_bytes();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

pub struct HypervisorSupervisor {
    host: Arc<dyn HostActions>,
    jailer_uid: u32,
    jailer_gid: u32,
    stop_timeout: Duration,
}

impl HypervisorSupervisor {
    pub fn new(host: Arc<dyn HostActions>, jailer_uid: u32, jailer_gid: u32) -> Self {
        Self {
            host,
            jailer_uid,
            jailer_gid,
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn api_sock_path(jail_root: &str) -> String {
        format!("{jail_root}/run/api.sock")
    }

    fn launch_config(
        &self,
        vm: &VmRecord,
        rootfs_path: &str,
        kernel_path: &str,
        tap_name: &str,
        restore: Option<(String, String)>,
    ) -> HypervisorLaunchConfig {
        let jail_root = format!(
            "{}",
            Path::new(rootfs_path).parent().unwrap().display()
        );
        HypervisorLaunchConfig {
            jail_root: jail_root.clone(),
            uid: self.jailer_uid,
            gid: self.jailer_gid,
            vm_id: vm.id.to_string(),
            kernel_path: kernel_path.to_string(),
            rootfs_path: rootfs_path.to_string(),
            tap_name: tap_name.to_string(),
            mac: mac_for_vm(&vm.id),
            vcpu: vm.cpu,
            mem_mb: vm.mem_mb,
            vsock_cid: vm.vsock_cid,
            uds_path: format!("{jail_root}/run/v.sock"),
            api_sock_path: Self::api_sock_path(&jail_root),
            log_path: format!("{jail_root}/logs/hypervisor.log"),
            restore,
        }
    }

    async fn apply_machine_config(
        &self,
        config: &HypervisorLaunchConfig,
        logs_dir: &str,
    ) -> CoreResult<()> {
        let client = uds_client();
        let sock = &config.api_sock_path;

        api_request(
            &client,
            sock,
            Method::PUT,
            "/machine-config",
            serde_json::json!({"vcpu_count": config.vcpu, "mem_size_mib": config.mem_mb, "smt": false}),
        )
        .await?;

        api_request(
            &client,
            sock,
            Method::PUT,
            "/boot-source",
            serde_json::json!({
                "kernel_image_path": config.kernel_path,
                "boot_args": "console=ttyS0 reboot=k panic=1 pci=off",
            }),
        )
        .await?;

        api_request(
            &client,
            sock,
            Method::PUT,
            "/drives/rootfs",
            serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": config.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        api_request(
            &client,
            sock,
            Method::PUT,
            "/network-interfaces/eth0",
            serde_json::json!({
                "iface_id": "eth0",
                "host_dev_name": config.tap_name,
                "guest_mac": config.mac,
            }),
        )
        .await?;

        api_request(
            &client,
            sock,
            Method::PUT,
            "/vsock",
            serde_json::json!({
                "guest_cid": config.vsock_cid,
                "uds_path": config.uds_path,
            }),
        )
        .await?;

        api_request(
            &client,
            sock,
            Method::PUT,
            "/logger",
            serde_json::json!({"log_path": format!("{logs_dir}/hypervisor.log"), "level": "Info"}),
        )
        .await?;

        api_request(
            &client,
            sock,
            Method::PUT,
            "/metrics",
            serde_json::json!({"metrics_path": format!("{logs_dir}/metrics.json"), "level": "Info"}),
        )
        .await
    }

    pub async fn create_and_start(
        &self,
        vm: &VmRecord,
        rootfs_path: &str,
        kernel_path: &str,
        tap_name: &str,
    ) -> CoreResult<u32> {
        let config = self.launch_config(vm, rootfs_path, kernel_path, tap_name, None);
        let pid = self.host.spawn_hypervisor(&config).await?;
        self.apply_machine_config(&config, &vm.logs_dir).await?;

        let client = uds_client();
        api_request(
            &client,
            &config.api_sock_path,
            Method::PUT,
            "/actions",
            serde_json::json!({"action_type": "InstanceStart"}),
        )
        .await?;
        Ok(pid)
    }

    pub async fn restore_from_snapshot(
        &self,
        vm: &VmRecord,
        rootfs_path: &str,
        kernel_path: &str,
        tap_name: &str,
        mem_path: &str,
        state_path: &str,
    ) -> CoreResult<u32> {
        let config = self.launch_config(
            vm,
            rootfs_path,
            kernel_path,
            tap_name,
            Some((mem_path.to_string(), state_path.to_string())),
        );
        let pid = self.host.spawn_hypervisor(&config).await?;

        // The snapshot embeds network config for the VM's eth0; do NOT
        // reconfigure boot-specific resources before the load (spec §4.5
        // step 4: the orchestrator re-IPs the guest over vsock afterward).
        let client = uds_client();
        api_request(
            &client,
            &config.api_sock_path,
            Method::PUT,
            "/snapshot/load",
            serde_json::json!({
                "mem_file_path": mem_path,
                "snapshot_path": state_path,
                "enable_diff_snapshots": false,
                "resume_vm": true,
            }),
        )
        .await?;
        Ok(pid)
    }

    pub async fn create_snapshot(
        &self,
        jail_root: &str,
        mem_path: &str,
        state_path: &str,
    ) -> CoreResult<()> {
        let api_sock = Self::api_sock_path(jail_root);
        let client = uds_client();

        api_request(
            &client,
            &api_sock,
            Method::PATCH,
            "/vm",
            serde_json::json!({"state": "Paused"}),
        )
        .await?;

        api_request(
            &client,
            &api_sock,
            Method::PUT,
            "/snapshot/create",
            serde_json::json!({
                "mem_file_path": mem_path,
                "snapshot_path": state_path,
                "snapshot_type": "Full",
            }),
        )
        .await?;

        api_request(
            &client,
            &api_sock,
            Method::PATCH,
            "/vm",
            serde_json::json!({"state": "Resumed"}),
        )
        .await
    }

    pub async fn stop(&self, pid: u32) -> CoreResult<()> {
        self.host.signal_process(pid, "TERM").await?;
        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.host.process_alive(pid).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.host.signal_process(pid, "KILL").await
    }

    pub async fn destroy(&self, pid: u32, jail_root: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Err(e) = self.stop(pid).await {
            warnings.push(format!("hypervisor stop: {e}"));
        }
        let sock = Self::api_sock_path(jail_root);
        if tokio::fs::metadata(&sock).await.is_ok() {
            if let Err(e) = tokio::fs::remove_file(&sock).await {
                warnings.push(format!("remove api sock: {e}"));
            }
        }
        warnings
    }
}
