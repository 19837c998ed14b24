//! Control-plane HTTP API (spec §6): one `Router` merged in `main.rs`,
//! handlers thin wrappers around the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use sandbox_core::model::VmRecord;
use sandbox_core::vsock::{ExecBody, RunTsBody};
use sandbox_core::Orchestrator;
use sandbox_types::{
    CreateVmReq, ExecReq, ExecResp, ListVmsResp, RunTsReq, SnapshotView, VmView,
};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/vms", get(list_vms).post(create_vm))
        .route("/v1/vms/:id", get(get_vm))
        .route("/v1/vms/:id/start", post(start_vm))
        .route("/v1/vms/:id/stop", post(stop_vm))
        .route("/v1/vms/:id", delete(destroy_vm))
        .route("/v1/vms/:id/exec", post(exec_vm))
        .route("/v1/vms/:id/run-ts", post(run_ts_vm))
        .route("/v1/vms/:id/files/upload", post(upload_file))
        .route("/v1/vms/:id/files/download", get(download_file))
        .route("/v1/vms/:id/snapshots", post(create_snapshot))
        .with_state(state)
}

fn to_view(vm: VmRecord) -> VmView {
    VmView {
        id: vm.id,
        created_at: vm.created_at,
        updated_at: vm.updated_at,
        cpu: vm.cpu,
        mem_mb: vm.mem_mb,
        vsock_cid: vm.vsock_cid,
        tap_name: vm.tap_name,
        guest_ip: vm.guest_ip,
        outbound_internet: vm.outbound_internet,
        allow_ips: vm.allow_ips,
        image_id: vm.image_id,
        state: vm.state,
        provision_mode: vm.provision_mode,
    }
}

async fn list_vms(State(state): State<AppState>) -> ApiResult<Json<ListVmsResp>> {
    let items = state.orchestrator.list().await?.into_iter().map(to_view).collect();
    Ok(Json(ListVmsResp { items }))
}

async fn create_vm(
    State(state): State<AppState>,
    Json(req): Json<CreateVmReq>,
) -> ApiResult<impl IntoResponse> {
    let vm = state
        .orchestrator
        .create(
            req.cpu,
            req.mem_mb,
            req.allow_ips,
            req.outbound_internet,
            req.snapshot_id,
            req.image_id,
            req.disk_size_mb,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(to_view(vm))))
}

async fn get_vm(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<VmView>> {
    let vm = state.orchestrator.get(id).await?;
    Ok(Json(to_view(vm)))
}

async fn start_vm(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<VmView>> {
    let vm = state.orchestrator.start(id).await?;
    Ok(Json(to_view(vm)))
}

async fn stop_vm(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<VmView>> {
    let vm = state.orchestrator.stop(id).await?;
    Ok(Json(to_view(vm)))
}

async fn destroy_vm(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<VmView>> {
    let vm = state.orchestrator.destroy(id).await?;
    Ok(Json(to_view(vm)))
}

async fn exec_vm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExecReq>,
) -> ApiResult<Json<ExecResp>> {
    let body = ExecBody {
        cmd: req.cmd,
        cwd: req.cwd,
        env: req.env,
        timeout_ms: req.timeout_ms,
    };
    let result = state.orchestrator.exec(id, &body).await?;
    Ok(Json(ExecResp {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
    }))
}

async fn run_ts_vm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RunTsReq>,
) -> ApiResult<Json<ExecResp>> {
    let body = RunTsBody {
        path: req.path,
        code: req.code,
        args: req.args,
        timeout_ms: req.timeout_ms,
        allow_net: req.allow_net,
    };
    let result = state.orchestrator.run_ts(id, &body).await?;
    Ok(Json(ExecResp {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
    }))
}

async fn upload_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> ApiResult<StatusCode> {
    let dest = params
        .get("dest")
        .cloned()
        .ok_or_else(|| ApiError(sandbox_core::CoreError::validation("missing dest query parameter")))?;
    state.orchestrator.upload(id, &dest, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let path = params
        .get("path")
        .cloned()
        .ok_or_else(|| ApiError(sandbox_core::CoreError::validation("missing path query parameter")))?;
    let data = state.orchestrator.download(id, &path).await?;
    Ok(([(header::CONTENT_TYPE, "application/gzip")], data))
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let meta = state.orchestrator.create_snapshot(id, None).await?;
    Ok((
        StatusCode::CREATED,
        Json(SnapshotView {
            id: meta.id,
            kind: meta.kind.as_str().to_string(),
            created_at: meta.created_at,
            cpu: meta.cpu,
            mem_mb: meta.mem_mb,
            image_id: meta.image_id,
            source_vm_id: meta.source_vm_id,
            has_disk: meta.has_disk,
        }),
    ))
}
