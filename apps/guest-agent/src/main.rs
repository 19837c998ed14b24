//! In-guest agent (spec §4.4/§6). A small HTTP server reached over the
//! guest's virtio-vsock device, serving the contract the host-side
//! `VsockAgentClient` drives: health, firewall allowlist, network
//! configuration, command execution, and file transfer. Deliberately thin
//! per spec §1 — the host's egress chain is the authoritative boundary,
//! this agent's firewall/exec handling is best-effort.
//!
//! Mirrors the `core::uds_proxy::forward` shape (a raw
//! `hyper`/`hyper-util` server loop over a non-TCP transport) generalized
//! from a UNIX socket to an `AF_VSOCK` listener via `tokio-vsock`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn agent_port() -> u32 {
    std::env::var("AGENT_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5252)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let port = agent_port();
    let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port))?;
    info!(port, "guest agent listening on vsock");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "vsock accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(handle);
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                warn!(error = %e, ?peer, "connection error");
            }
        });
    }
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/health") => health().await,
        (&Method::POST, "/firewall/allowlist") => apply_allowlist(req).await,
        (&Method::POST, "/net/config") => configure_network(req).await,
        (&Method::POST, "/exec") => exec(req).await,
        (&Method::POST, "/run-ts") => run_ts(req).await,
        (&Method::POST, "/files/upload") => upload(req, &query).await,
        (&Method::GET, "/files/download") => download(&query).await,
        _ => Ok(json_response(StatusCode::NOT_FOUND, &serde_json::json!({"error": "not found"}))),
    };

    Ok(result.unwrap_or_else(|e| {
        error!(error = %e, %path, "handler failed");
        json_response(StatusCode::INTERNAL_SERVER_ERROR, &serde_json::json!({"error": e}))
    }))
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(body).unwrap())))
        .unwrap()
}

fn binary_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/gzip")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

async fn body_bytes(req: Request<Incoming>) -> Result<Bytes, String> {
    req.into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

async fn body_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, String> {
    let bytes = body_bytes(req).await?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid json body: {e}"))
}

fn query_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((
                urlencoding::decode(k).ok()?.into_owned(),
                urlencoding::decode(v).ok()?.into_owned(),
            ))
        })
        .collect()
}

async fn health() -> Result<Response<Full<Bytes>>, String> {
    Ok(json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})))
}

#[derive(Deserialize)]
struct AllowlistReq {
    #[serde(rename = "outboundInternet")]
    outbound_internet: bool,
    #[serde(rename = "allowIps")]
    allow_ips: Vec<String>,
}

/// Best-effort in-guest firewall (spec §9: "the guest-side enforcement is
/// best-effort only and may silently no-op if the in-guest firewall
/// utility is absent" — the host chain is the authoritative boundary).
async fn apply_allowlist(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, String> {
    let body: AllowlistReq = body_json(req).await?;

    if which("iptables").await.is_none() {
        warn!("iptables not present in guest image, allowlist is a no-op");
        return Ok(json_response(StatusCode::OK, &serde_json::json!({"applied": false})));
    }

    let _ = run("iptables", &["-F", "GUEST_OUT"]).await;
    let _ = run("iptables", &["-N", "GUEST_OUT"]).await;
    let _ = run("iptables", &["-F", "GUEST_OUT"]).await;
    let _ = run(
        "iptables",
        &["-A", "GUEST_OUT", "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
    )
    .await;
    if body.outbound_internet {
        for ip in &body.allow_ips {
            let _ = run("iptables", &["-A", "GUEST_OUT", "-d", ip, "-j", "ACCEPT"]).await;
        }
    }
    let _ = run("iptables", &["-A", "GUEST_OUT", "-j", "DROP"]).await;
    let _ = run("iptables", &["-C", "OUTPUT", "-j", "GUEST_OUT"]).await;
    let _ = run("iptables", &["-I", "OUTPUT", "1", "-j", "GUEST_OUT"]).await;

    Ok(json_response(StatusCode::OK, &serde_json::json!({"applied": true})))
}

#[derive(Deserialize)]
struct ConfigureNetworkReq {
    #[serde(default = "default_iface")]
    iface: String,
    ip: String,
    #[serde(default = "default_cidr")]
    cidr: u8,
    gateway: String,
    #[serde(default)]
    #[allow(dead_code)]
    mac: Option<String>,
    #[serde(default)]
    dns: Option<String>,
    #[serde(default, rename = "dnsOnly")]
    dns_only: bool,
}

fn default_iface() -> String {
    "eth0".to_string()
}

fn default_cidr() -> u8 {
    24
}

async fn configure_network(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, String> {
    let body: ConfigureNetworkReq = body_json(req).await?;

    if !body.dns_only {
        let cidr_spec = format!("{}/{}", body.ip, body.cidr);
        run("ip", &["addr", "flush", "dev", &body.iface]).await?;
        run("ip", &["addr", "add", &cidr_spec, "dev", &body.iface]).await?;
        run("ip", &["link", "set", &body.iface, "up"]).await?;
        run("ip", &["route", "replace", "default", "via", &body.gateway]).await?;
    }

    if let Some(dns) = &body.dns {
        tokio::fs::write("/etc/resolv.conf", format!("nameserver {dns}\n"))
            .await
            .map_err(|e| e.to_string())?;
    }

    Ok(json_response(StatusCode::OK, &serde_json::json!({"configured": true})))
}

#[derive(Deserialize)]
struct ExecReq {
    cmd: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default, rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct ExecResult {
    #[serde(rename = "exitCode")]
    exit_code: i32,
    stdout: String,
    stderr: String,
}

async fn exec(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, String> {
    let body: ExecReq = body_json(req).await?;
    let mut cmd = Command::new("sh");
    cmd.args(["-c", &body.cmd]);
    if let Some(cwd) = &body.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &body.env {
        cmd.envs(env);
    }
    let result = run_with_timeout(cmd, body.timeout_ms).await;
    Ok(json_response(StatusCode::OK, &serde_json::to_value(result).unwrap()))
}

#[derive(Deserialize)]
struct RunTsReq {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default, rename = "timeoutMs")]
    timeout_ms: Option<u64>,
    #[serde(default, rename = "allowNet")]
    #[allow(dead_code)]
    allow_net: bool,
}

/// Executes a TypeScript script with `node`'s built-in type-stripping
/// support. `allowNet` is accepted for contract compatibility but enforced
/// only by the host egress chain (spec §9) — there is no in-guest runtime
/// sandbox here.
async fn run_ts(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, String> {
    let body: RunTsReq = body_json(req).await?;

    let script_path = match (&body.path, &body.code) {
        (Some(p), _) => p.clone(),
        (None, Some(code)) => {
            let tmp = format!("/tmp/run-ts-{}.ts", uuid_like());
            tokio::fs::write(&tmp, code).await.map_err(|e| e.to_string())?;
            tmp
        }
        (None, None) => return Err("run-ts requires either path or code".to_string()),
    };

    let mut cmd = Command::new("node");
    cmd.arg("--experimental-strip-types").arg(&script_path);
    if let Some(args) = &body.args {
        cmd.args(args);
    }
    let result = run_with_timeout(cmd, body.timeout_ms).await;
    Ok(json_response(StatusCode::OK, &serde_json::to_value(result).unwrap()))
}

async fn run_with_timeout(mut cmd: Command, timeout_ms: Option<u64>) -> ExecResult {
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return ExecResult { exit_code: -1, stdout: String::new(), stderr: e.to_string() };
        }
    };

    let wait = child.wait_with_output();
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(60_000));
    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(output)) => ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Ok(Err(e)) => ExecResult { exit_code: -1, stdout: String::new(), stderr: e.to_string() },
        Err(_) => ExecResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: "timed out".to_string(),
        },
    }
}

async fn upload(req: Request<Incoming>, query: &str) -> Result<Response<Full<Bytes>>, String> {
    let params = query_params(query);
    let dest = params.get("dest").ok_or("missing dest query parameter")?;
    let bytes = body_bytes(req).await?;

    tokio::fs::create_dir_all(dest).await.map_err(|e| e.to_string())?;
    let tmp = format!("/tmp/upload-{}.tar.gz", uuid_like());
    tokio::fs::write(&tmp, &bytes).await.map_err(|e| e.to_string())?;
    let out = run("tar", &["-xzf", &tmp, "-C", dest]).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    out?;

    Ok(json_response(StatusCode::NO_CONTENT, &serde_json::json!({})))
}

async fn download(query: &str) -> Result<Response<Full<Bytes>>, String> {
    let params = query_params(query);
    let path = params.get("path").ok_or("missing path query parameter")?;

    let path_buf = std::path::Path::new(path);
    let parent = path_buf.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("/"));
    let base = path_buf
        .file_name()
        .ok_or("path has no file name")?
        .to_string_lossy()
        .into_owned();

    let tmp = format!("/tmp/download-{}.tar.gz", uuid_like());
    run("tar", &["-czf", &tmp, "-C", &parent.to_string_lossy(), &base]).await?;
    let bytes = tokio::fs::read(&tmp).await.map_err(|e| e.to_string())?;
    let _ = tokio::fs::remove_file(&tmp).await;

    Ok(binary_response(StatusCode::OK, bytes))
}

async fn run(program: &str, args: &[&str]) -> Result<(), String> {
    let out = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("{program}: {e}"))?;
    if !out.status.success() {
        return Err(format!(
            "{program} {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(())
}

async fn which(program: &str) -> Option<()> {
    Command::new("which").arg(program).output().await.ok().filter(|o| o.status.success()).map(|_| ())
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("{nanos:x}")
}
