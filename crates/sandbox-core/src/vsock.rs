//! Vsock Agent Client (spec §4.4). No single source file owns this
//! exact `CONNECT`/`OK` framing; it is hand-rolled over `tokio::net::UnixStream`
//! in the idiom of general raw-framed-protocol-over-socket code in the
//! broader pack (per-byte scanning for a marker across read boundaries,
//! then handing the remainder to a standard parser).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use regex::Regex;
use std::sync::OnceLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::config::VsockConfig;
use crate::error::{CoreError, CoreResult};

fn network_error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)network is unreachable|connection refused|no such device|no such file|does not exist|connection reset|econnreset",
        )
        .unwrap()
    })
}

fn handshake_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^OK \d+$").unwrap())
}

/// Effective per-request timeout, spec §4.4: `max(defaultMs, min(requestTimeoutMs + 5s, 5min))`.
fn effective_timeout_ms(default_ms: u64, request_timeout_ms: Option<u64>) -> u64 {
    let five_min = 5 * 60 * 1000;
    match request_timeout_ms {
        None => default_ms,
        Some(req) => default_ms.max((req + 5_000).min(five_min)),
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecBody {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<std::collections::HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunTsBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    #[serde(rename = "allowNet")]
    pub allow_net: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecResult {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConfigureNetworkBody {
    pub iface: String,
    pub ip: String,
    pub cidr: u8,
    pub gateway: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    #[serde(rename = "dnsOnly", skip_serializing_if = "std::ops::Not::not")]
    pub dns_only: bool,
}

/// Raw transport-layer outcome of a single handshake+HTTP attempt.
enum AttemptOutcome {
    /// Full HTTP response bytes parsed.
    Response(ParsedResponse),
    /// No HTTP response bytes observed at all; may be retried.
    Retriable(String),
    /// Observed partial/garbled HTTP bytes, or a FAIL handshake: not retriable.
    Fatal(CoreError),
}

struct ParsedResponse {
    status: u16,
    body: Vec<u8>,
}

pub struct VsockAgentClient {
    config: VsockConfig,
}

impl VsockAgentClient {
    /// Construct a client after verifying the host has a vsock backing
    /// device. Absence is permanent and surfaced on every subsequent call.
    pub fn new(config: VsockConfig) -> CoreResult<Self> {
        if !Path::new("/dev/vsock").exists() {
            return Err(CoreError::FatalState(
                "no vsock backing device (/dev/vsock) available on this host".into(),
            ));
        }
        Ok(Self { config })
    }

    fn uds_path(chroot_base: &str, vm_id: &uuid::Uuid) -> PathBuf {
        PathBuf::from(format!("{chroot_base}/{vm_id}/run/v.sock"))
    }

    async fn single_attempt(
        uds_path: &Path,
        agent_port: u32,
        request: &[u8],
        deadline: Duration,
        max_response_bytes: u64,
    ) -> AttemptOutcome {
        let connect = tokio::time::timeout(deadline, UnixStream::connect(uds_path)).await;
        let mut stream = match connect {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return AttemptOutcome::Retriable(e.to_string()),
            Err(_) => return AttemptOutcome::Retriable("connect timed out".into()),
        };

        let handshake = format!("CONNECT {agent_port}\n");
        if let Err(e) = stream.write_all(handshake.as_bytes()).await {
            return AttemptOutcome::Retriable(e.to_string());
        }

        let mut buf = BytesMut::with_capacity(8192);
        let mut line: Option<String> = None;
        let read_deadline = tokio::time::Instant::now() + deadline;
        while line.is_none() {
            if tokio::time::Instant::now() >= read_deadline {
                return AttemptOutcome::Retriable("timed out waiting for handshake reply".into());
            }
            let mut chunk = [0u8; 4096];
            let n = match tokio::time::timeout(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return AttemptOutcome::Retriable("eof before handshake reply".into()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return AttemptOutcome::Retriable(e.to_string()),
                Err(_) => return AttemptOutcome::Retriable("timed out reading handshake".into()),
            };
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let head = buf.split_to(pos + 1);
                let text = String::from_utf8_lossy(&head[..head.len() - 1]).to_string();
                line = Some(text);
            }
        }
        let line = line.unwrap();

        if let Some(rest) = line.strip_prefix("FAIL") {
            return AttemptOutcome::Fatal(CoreError::ProtocolViolation(format!(
                "vsock handshake failed:{rest}"
            )));
        }
        if !line.starts_with("OK ") {
            return AttemptOutcome::Fatal(CoreError::ProtocolViolation(format!(
                "unexpected handshake line: {line}"
            )));
        }

        if let Err(e) = stream.write_all(request).await {
            return AttemptOutcome::Retriable(e.to_string());
        }

        // Any bytes left over in `buf` from the same read as the handshake
        // line belong to the HTTP stream already.
        let mut carry = buf;
        match read_http_response(&mut stream, &mut carry, deadline, max_response_bytes).await {
            Ok(Some(parsed)) => AttemptOutcome::Response(parsed),
            Ok(None) => {
                // No HTTP bytes at all: handshake-only or clean/EOF exit.
                if handshake_only_re().is_match(&line) {
                    AttemptOutcome::Retriable("handshake-only, no response bytes".into())
                } else {
                    AttemptOutcome::Retriable("zero stdout bytes, clean transport exit".into())
                }
            }
            Err(ReadError::Network(msg)) => {
                if carry.is_empty() && network_error_re().is_match(&msg) {
                    AttemptOutcome::Retriable(msg)
                } else {
                    AttemptOutcome::Fatal(CoreError::TransientTransport(msg))
                }
            }
            Err(ReadError::TooLarge) => AttemptOutcome::Fatal(CoreError::ProtocolViolation(
                "response exceeded maxResponseBytes".into(),
            )),
            Err(ReadError::Malformed(msg)) => {
                AttemptOutcome::Fatal(CoreError::ProtocolViolation(msg))
            }
        }
    }

    async fn exchange(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        request: &[u8],
        timeout_ms: u64,
        max_response_bytes: u64,
    ) -> CoreResult<ParsedResponse> {
        let uds_path = Self::uds_path(chroot_base, vm_id);
        let deadline = Duration::from_millis(timeout_ms);
        let mut last_err = String::new();

        for attempt in 0..self.config.retry_attempts.max(1) {
            match Self::single_attempt(&uds_path, agent_port, request, deadline, max_response_bytes).await {
                AttemptOutcome::Response(r) => return Ok(r),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::Retriable(msg) => {
                    last_err = msg;
                    if attempt + 1 < self.config.retry_attempts.max(1) {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    }
                }
            }
        }
        Err(CoreError::TransientTransport(format!(
            "vsock exchange exhausted {} attempts: {last_err}",
            self.config.retry_attempts
        )))
    }

    fn build_request(method: &str, path: &str, body: &[u8], content_type: &str) -> Vec<u8> {
        let mut req = format!(
            "{method} {path} HTTP/1.1\r\nHost: agent\r\nConnection: close\r\nContent-Length: {}\r\n",
            body.len()
        );
        if !body.is_empty() {
            req.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        req.push_str("\r\n");
        let mut out = req.into_bytes();
        out.extend_from_slice(body);
        out
    }

    async fn request_json<B: Serialize, R: DeserializeOwned>(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        method: &str,
        path: &str,
        body: Option<&B>,
        timeout_ms: u64,
    ) -> CoreResult<R> {
        let body_bytes = match body {
            Some(b) => serde_json::to_vec(b)
                .map_err(|e| CoreError::ProtocolViolation(format!("encode request: {e}")))?,
            None => Vec::new(),
        };
        let req = Self::build_request(method, path, &body_bytes, "application/json");
        let resp = self
            .exchange(
                chroot_base,
                vm_id,
                agent_port,
                &req,
                timeout_ms,
                self.config.max_json_response_bytes,
            )
            .await?;
        if resp.status >= 400 {
            return Err(CoreError::ProtocolViolation(format!(
                "guest agent {path} returned status {}",
                resp.status
            )));
        }
        if resp.body.is_empty() {
            return serde_json::from_slice(b"null")
                .map_err(|e| CoreError::ProtocolViolation(format!("decode empty response: {e}")));
        }
        serde_json::from_slice(&resp.body)
            .map_err(|e| CoreError::ProtocolViolation(format!("decode response: {e}")))
    }

    pub async fn health(&self, chroot_base: &str, vm_id: &uuid::Uuid, agent_port: u32) -> CoreResult<()> {
        let req = Self::build_request("GET", "/health", &[], "application/json");
        let resp = self
            .exchange(chroot_base, vm_id, agent_port, &req, self.config.health_ms, self.config.max_json_response_bytes)
            .await?;
        if resp.status == 200 {
            Ok(())
        } else {
            Err(CoreError::ProtocolViolation(format!(
                "health check returned status {}",
                resp.status
            )))
        }
    }

    pub async fn apply_allowlist(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        outbound_internet: bool,
        allow_ips: &[String],
    ) -> CoreResult<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            #[serde(rename = "outboundInternet")]
            outbound_internet: bool,
            #[serde(rename = "allowIps")]
            allow_ips: &'a [String],
        }
        let _: serde_json::Value = self
            .request_json(
                chroot_base,
                vm_id,
                agent_port,
                "POST",
                "/firewall/allowlist",
                Some(&Body { outbound_internet, allow_ips }),
                self.config.timeout_ms,
            )
            .await?;
        Ok(())
    }

    pub async fn configure_network(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        body: &ConfigureNetworkBody,
    ) -> CoreResult<()> {
        let _: serde_json::Value = self
            .request_json(
                chroot_base,
                vm_id,
                agent_port,
                "POST",
                "/net/config",
                Some(body),
                self.config.timeout_ms,
            )
            .await?;
        Ok(())
    }

    pub async fn exec(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        default_timeout_ms: u64,
        body: &ExecBody,
    ) -> CoreResult<ExecResult> {
        let timeout_ms = effective_timeout_ms(default_timeout_ms, body.timeout_ms);
        self.request_json(chroot_base, vm_id, agent_port, "POST", "/exec", Some(body), timeout_ms)
            .await
    }

    pub async fn run_ts(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        default_timeout_ms: u64,
        body: &RunTsBody,
    ) -> CoreResult<ExecResult> {
        let timeout_ms = effective_timeout_ms(default_timeout_ms, body.timeout_ms);
        self.request_json(chroot_base, vm_id, agent_port, "POST", "/run-ts", Some(body), timeout_ms)
            .await
    }

    pub async fn upload(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        dest: &str,
        data: Vec<u8>,
    ) -> CoreResult<()> {
        let path = format!("/files/upload?dest={}", urlencoding::encode(dest));
        let req = Self::build_request("POST", &path, &data, "application/gzip");
        let resp = self
            .exchange(
                chroot_base,
                vm_id,
                agent_port,
                &req,
                self.config.binary_ms,
                self.config.max_binary_response_bytes,
            )
            .await?;
        if resp.status >= 400 {
            return Err(CoreError::ProtocolViolation(format!(
                "upload returned status {}",
                resp.status
            )));
        }
        Ok(())
    }

    pub async fn download(
        &self,
        chroot_base: &str,
        vm_id: &uuid::Uuid,
        agent_port: u32,
        path: &str,
    ) -> CoreResult<Vec<u8>> {
        let uri = format!("/files/download?path={}", urlencoding::encode(path));
        let req = Self::build_request("GET", &uri, &[], "application/json");
        let resp = self
            .exchange(
                chroot_base,
                vm_id,
                agent_port,
                &req,
                self.config.binary_ms,
                self.config.max_binary_response_bytes,
            )
            .await?;
        if resp.status >= 400 {
            return Err(CoreError::ProtocolViolation(format!(
                "download returned status {}",
                resp.status
            )));
        }
        Ok(resp.body)
    }
}

enum ReadError {
    Network(String),
    TooLarge,
    Malformed(String),
}

/// Scans across read boundaries for the `HTTP/` marker (spec §4.4, §9), then
/// parses headers by hand and reads exactly `Content-Length` body bytes.
/// Returns `Ok(None)` if the stream closed before any `HTTP/` bytes appeared.
async fn read_http_response(
    stream: &mut UnixStream,
    carry: &mut BytesMut,
    deadline: Duration,
    max_response_bytes: u64,
) -> Result<Option<ParsedResponse>, ReadError> {
    const MARKER: &[u8] = b"HTTP/";
    let mut buf = std::mem::take(carry);
    let mut total: u64 = buf.len() as u64;
    let read_deadline = tokio::time::Instant::now() + deadline;

    let marker_pos = loop {
        if let Some(pos) = find_subslice(&buf, MARKER) {
            break pos;
        }
        if tokio::time::Instant::now() >= read_deadline {
            return Err(ReadError::Network("timed out waiting for HTTP/ marker".into()));
        }
        let mut chunk = [0u8; 8192];
        let n = match tokio::time::timeout(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(ReadError::Network("eof before HTTP/ marker".into()));
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ReadError::Network(e.to_string())),
            Err(_) => return Err(ReadError::Network("read timed out".into())),
        };
        total += n as u64;
        if total > max_response_bytes {
            return Err(ReadError::TooLarge);
        }
        // keep only the last MARKER.len()-1 bytes of buf as tail context
        if buf.len() >= MARKER.len() {
            let keep_from = buf.len() - (MARKER.len() - 1);
            let _ = buf.split_to(keep_from);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if marker_pos > 0 {
        buf.advance(marker_pos);
    }

    // Read until we have full headers (\r\n\r\n).
    loop {
        if let Some(header_end) = find_subslice(&buf, b"\r\n\r\n") {
            let headers_raw = &buf[..header_end];
            let headers_text = String::from_utf8_lossy(headers_raw);
            let mut lines = headers_text.split("\r\n");
            let status_line = lines.next().unwrap_or("");
            let status = parse_status(status_line)?;

            let mut content_length: Option<u64> = None;
            for line in lines {
                if let Some((k, v)) = line.split_once(':') {
                    if k.trim().eq_ignore_ascii_case("content-length") {
                        content_length = v.trim().parse().ok();
                    }
                }
            }
            let body_start = header_end + 4;
            let mut body = buf.split_off(body_start);
            drop(buf);

            let needed = content_length.unwrap_or(0);
            loop {
                if body.len() as u64 >= needed {
                    body.truncate(needed as usize);
                    let _ = stream.shutdown().await;
                    return Ok(Some(ParsedResponse { status, body: body.to_vec() }));
                }
                if tokio::time::Instant::now() >= read_deadline {
                    return Err(ReadError::Network("timed out reading body".into()));
                }
                let mut chunk = [0u8; 8192];
                let n = match tokio::time::timeout(deadline, stream.read(&mut chunk)).await {
                    Ok(Ok(0)) => return Err(ReadError::Network("eof before body complete".into())),
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(ReadError::Network(e.to_string())),
                    Err(_) => return Err(ReadError::Network("read timed out".into())),
                };
                total += n as u64;
                if total > max_response_bytes {
                    return Err(ReadError::TooLarge);
                }
                body.extend_from_slice(&chunk[..n]);
            }
        }
        if tokio::time::Instant::now() >= read_deadline {
            return Err(ReadError::Network("timed out reading headers".into()));
        }
        let mut chunk = [0u8; 8192];
        let n = match tokio::time::timeout(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ReadError::Network("eof before headers complete".into())),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ReadError::Network(e.to_string())),
            Err(_) => return Err(ReadError::Network("read timed out".into())),
        };
        total += n as u64;
        if total > max_response_bytes {
            return Err(ReadError::TooLarge);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_status(status_line: &str) -> Result<u16, ReadError> {
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ReadError::Malformed(format!("unparseable status line: {status_line}")))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_uses_default_when_unset() {
        assert_eq!(effective_timeout_ms(10_000, None), 10_000);
    }

    #[test]
    fn effective_timeout_adds_five_seconds_and_caps_at_five_minutes() {
        assert_eq!(effective_timeout_ms(10_000, Some(1_000)), 10_000);
        assert_eq!(effective_timeout_ms(10_000, Some(20_000)), 25_000);
        assert_eq!(effective_timeout_ms(10_000, Some(10 * 60 * 1000)), 5 * 60 * 1000);
    }

    #[test]
    fn handshake_only_regex_matches_ok_line_alone() {
        assert!(handshake_only_re().is_match("OK 42"));
        assert!(!handshake_only_re().is_match("OK 42 extra"));
    }

    #[test]
    fn network_error_regex_is_case_insensitive() {
        assert!(network_error_re().is_match("Connection Refused"));
        assert!(network_error_re().is_match("ECONNRESET"));
        assert!(!network_error_re().is_match("permission denied"));
    }

    #[test]
    fn marker_scan_finds_http_slash_across_prefix_bytes() {
        let hay = b"junkframingbytesHTTP/1.1 200 OK\r\n\r\n";
        let pos = find_subslice(hay, b"HTTP/").unwrap();
        assert_eq!(&hay[pos..pos + 5], b"HTTP/");
    }
}
