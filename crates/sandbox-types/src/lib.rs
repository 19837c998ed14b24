//! Wire types shared between the control-plane HTTP API, the orchestrator
//! core, and the in-guest agent. Kept dependency-light (serde + uuid +
//! chrono + utoipa) so it can be pulled into either side of the vsock
//! boundary without dragging in axum or sqlx.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum VmState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleted,
    Error,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Created => "created",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Deleted => "deleted",
            VmState::Error => "error",
        }
    }
}

impl std::str::FromStr for VmState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => VmState::Created,
            "starting" => VmState::Starting,
            "running" => VmState::Running,
            "stopping" => VmState::Stopping,
            "stopped" => VmState::Stopped,
            "deleted" => VmState::Deleted,
            "error" => VmState::Error,
            other => return Err(format!("unknown vm state {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionMode {
    Boot,
    Snapshot,
}

impl ProvisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionMode::Boot => "boot",
            ProvisionMode::Snapshot => "snapshot",
        }
    }
}

impl std::str::FromStr for ProvisionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "boot" => ProvisionMode::Boot,
            "snapshot" => ProvisionMode::Snapshot,
            other => return Err(format!("unknown provision mode {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Template,
    Vm,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Template => "template",
            SnapshotKind::Vm => "vm",
        }
    }
}

impl std::str::FromStr for SnapshotKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "template" => SnapshotKind::Template,
            "vm" => SnapshotKind::Vm,
            other => return Err(format!("unknown snapshot kind {other}")),
        })
    }
}

/// POST /v1/vms body.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmReq {
    pub cpu: u32,
    pub mem_mb: u32,
    #[serde(default)]
    pub allow_ips: Vec<String>,
    #[serde(default)]
    pub outbound_internet: bool,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub disk_size_mb: Option<u64>,
}

/// Public view of a VmRecord returned by the API — no host-internal paths
/// beyond what a caller needs to address the VM.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmView {
    pub id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub cpu: u32,
    pub mem_mb: u32,
    pub vsock_cid: u32,
    pub tap_name: String,
    pub guest_ip: String,
    pub outbound_internet: bool,
    pub allow_ips: Vec<String>,
    pub image_id: Option<String>,
    pub state: VmState,
    pub provision_mode: Option<ProvisionMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListVmsResp {
    pub items: Vec<VmView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecReq {
    pub cmd: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunTsReq {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub allow_net: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecResp {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub id: String,
    pub kind: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub cpu: u32,
    pub mem_mb: u32,
    pub image_id: Option<String>,
    pub source_vm_id: Option<Uuid>,
    pub has_disk: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureNetworkReq {
    #[serde(default = "default_iface")]
    pub iface: String,
    pub ip: String,
    #[serde(default = "default_cidr")]
    pub cidr: u8,
    pub gateway: String,
    pub mac: String,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub dns_only: bool,
}

fn default_iface() -> String {
    "eth0".to_string()
}

fn default_cidr() -> u8 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistReq {
    pub outbound_internet: bool,
    pub allow_ips: Vec<String>,
}

/// Activity event recorded by the orchestrator and pushed to the webhook
/// dispatch worker. `meta` carries free-form details — e.g. destroy's
/// aggregated teardown warnings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub vm_id: Uuid,
    pub kind: String,
    pub at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_round_trips_through_str() {
        for s in [
            VmState::Created,
            VmState::Starting,
            VmState::Running,
            VmState::Stopping,
            VmState::Stopped,
            VmState::Deleted,
            VmState::Error,
        ] {
            let parsed: VmState = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        assert!("nonsense".parse::<VmState>().is_err());
    }
}
