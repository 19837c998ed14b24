//! Configuration surface named in spec §6. Plain env-var reads with typed
//! defaults, via the established `std::env::var(...).unwrap_or_else`
//! idiom in `apps/manager/src/main.rs` rather than a generic config-file
//! framework.

#[derive(Debug, Clone)]
pub struct VsockConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub health_ms: u64,
    pub binary_ms: u64,
    pub max_json_response_bytes: u64,
    pub max_binary_response_bytes: u64,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 250,
            timeout_ms: 10_000,
            health_ms: 5_000,
            binary_ms: 30_000,
            max_json_response_bytes: 4 * 1024 * 1024,
            max_binary_response_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootfsCloneMode {
    Auto,
    Reflink,
    Copy,
}

impl std::str::FromStr for RootfsCloneMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auto" => RootfsCloneMode::Auto,
            "reflink" => RootfsCloneMode::Reflink,
            "copy" => RootfsCloneMode::Copy,
            other => return Err(format!("unknown rootfs clone mode {other}")),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub max_vms: u32,
    pub max_cpu: u32,
    pub max_mem_mb: u32,
    pub max_allow_ips: usize,
    pub max_exec_timeout_ms: u64,
    pub max_run_ts_timeout_ms: u64,
    pub vsock: VsockConfig,
    pub rootfs_clone_mode: RootfsCloneMode,
    pub enable_snapshots: bool,
    pub snapshot_template_cpu: u32,
    pub snapshot_template_mem_mb: u32,
    pub storage_root: String,
    pub chroot_base: String,
    pub jailer_uid: u32,
    pub jailer_gid: u32,
    pub agent_port: u32,
    pub subnet_cidr: String,
    pub gateway_ip: String,
    pub bridge_name: String,
    pub database_url: String,
    pub bind: String,
    pub activity_webhook_url: Option<String>,
    pub disk_size_headroom_mb: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            max_vms: env_or("SANDBOX_MAX_VMS", 64),
            max_cpu: env_or("SANDBOX_MAX_CPU", 8),
            max_mem_mb: env_or("SANDBOX_MAX_MEM_MB", 16_384),
            max_allow_ips: env_or("SANDBOX_MAX_ALLOW_IPS", 64usize),
            max_exec_timeout_ms: env_or("SANDBOX_MAX_EXEC_TIMEOUT_MS", 60_000),
            max_run_ts_timeout_ms: env_or("SANDBOX_MAX_RUN_TS_TIMEOUT_MS", 120_000),
            vsock: VsockConfig {
                retry_attempts: env_or("SANDBOX_VSOCK_RETRY_ATTEMPTS", 3),
                retry_delay_ms: env_or("SANDBOX_VSOCK_RETRY_DELAY_MS", 250),
                timeout_ms: env_or("SANDBOX_VSOCK_TIMEOUT_MS", 10_000),
                health_ms: env_or("SANDBOX_VSOCK_HEALTH_MS", 5_000),
                binary_ms: env_or("SANDBOX_VSOCK_BINARY_MS", 30_000),
                max_json_response_bytes: env_or(
                    "SANDBOX_VSOCK_MAX_JSON_RESPONSE_BYTES",
                    4 * 1024 * 1024,
                ),
                max_binary_response_bytes: env_or(
                    "SANDBOX_VSOCK_MAX_BINARY_RESPONSE_BYTES",
                    256 * 1024 * 1024,
                ),
            },
            rootfs_clone_mode: env_or("SANDBOX_ROOTFS_CLONE_MODE", RootfsCloneMode::Auto),
            enable_snapshots: env_or("SANDBOX_ENABLE_SNAPSHOTS", true),
            snapshot_template_cpu: env_or("SANDBOX_SNAPSHOT_TEMPLATE_CPU", 1),
            snapshot_template_mem_mb: env_or("SANDBOX_SNAPSHOT_TEMPLATE_MEM_MB", 256),
            storage_root: env_string("SANDBOX_STORAGE_ROOT", "/srv/sandbox"),
            chroot_base: env_string("SANDBOX_CHROOT_BASE", "/srv/sandbox/jails"),
            jailer_uid: env_or("SANDBOX_JAILER_UID", 10_000),
            jailer_gid: env_or("SANDBOX_JAILER_GID", 10_000),
            agent_port: env_or("SANDBOX_AGENT_PORT", 5252),
            subnet_cidr: env_string("SANDBOX_SUBNET_CIDR", "10.42.0.0/24"),
            gateway_ip: env_string("SANDBOX_GATEWAY_IP", "10.42.0.1"),
            bridge_name: env_string("SANDBOX_BRIDGE_NAME", "sbxbr0"),
            database_url: env_string("DATABASE_URL", "postgres://localhost/sandbox"),
            bind: env_string("SANDBOX_BIND", "127.0.0.1:18080"),
            activity_webhook_url: std::env::var("SANDBOX_ACTIVITY_WEBHOOK_URL").ok(),
            disk_size_headroom_mb: env_or("SANDBOX_DISK_HEADROOM_MB", 256),
        }
    }
}
