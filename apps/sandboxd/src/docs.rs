//! OpenAPI surface for the control-plane API, scoped to spec §6's
//! resource set via the standard `utoipa::OpenApi` + `SwaggerUi` composition.

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    components(schemas(
        sandbox_types::CreateVmReq,
        sandbox_types::VmView,
        sandbox_types::ListVmsResp,
        sandbox_types::ExecReq,
        sandbox_types::RunTsReq,
        sandbox_types::ExecResp,
        sandbox_types::SnapshotView,
    )),
    tags((name = "vms", description = "microVM sandbox lifecycle"))
)]
pub struct ApiDoc;

pub fn router(openapi: utoipa::openapi::OpenApi) -> Router {
    Router::new().merge(SwaggerUi::new("/docs").url("/openapi.json", openapi))
}
