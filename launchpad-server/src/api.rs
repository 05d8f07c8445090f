use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use launchpad_engine::{LifecycleEngine, Template};
use launchpad_models::{
    AuditEntry, CallbackBody, DeploymentRequest, DeploymentView, DestroyBody, Error, Operation,
    RejectBody, RequestView, ScaleBody, SubjectKind, SubmitRequestBody,
};

use crate::auth::Caller;

const CALLBACK_SECRET_HEADER: &str = "x-pipeline-secret";

/// Shared API state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LifecycleEngine>,
    pub callback_secret: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/catalog", get(list_catalog))
        .route("/api/catalog/:id", get(get_catalog_template))
        .route("/api/requests", post(submit_request).get(list_requests))
        .route("/api/requests/:id", get(get_request))
        .route("/api/requests/:id/approve", post(approve_request))
        .route("/api/requests/:id/reject", post(reject_request))
        .route("/api/deployments", get(list_deployments))
        .route("/api/deployments/:id", get(get_deployment))
        .route("/api/deployments/:id/scale", post(submit_scale))
        .route("/api/deployments/:id/destroy", post(submit_destroy))
        .route("/api/deployments/:id/operations", get(list_operations))
        .route("/api/operations/:id", get(get_operation))
        .route("/api/operations/:id/approve", post(approve_operation))
        .route("/api/operations/:id/reject", post(reject_operation))
        .route("/api/audit/:kind/:id", get(list_audit))
        .route("/api/pipeline/callback", post(pipeline_callback))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the API server
pub async fn start_server(host: &str, port: u16, state: AppState) -> Result<()> {
    let app = create_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("API server listening on {addr}");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {e}"))?;

    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum AppError {
    Unauthenticated(String),
    Engine(Error),
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Engine(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Engine(err) => {
                let status = match &err {
                    Error::Validation(_) => StatusCode::BAD_REQUEST,
                    Error::Authorization(_) => StatusCode::FORBIDDEN,
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::InvalidTransition(_) | Error::Conflict(_) => StatusCode::CONFLICT,
                    Error::PipelineUnavailable(_) | Error::PipelineRejected(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    Error::NotificationDelivery(_) | Error::Storage(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    tracing::error!("request failed: {err}");
                }
                (status, err.to_string())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ============================================================================
// Health Check
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "launchpad",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ============================================================================
// Catalog
// ============================================================================

async fn list_catalog(State(state): State<AppState>) -> Json<Vec<Template>> {
    Json(state.engine.templates())
}

async fn get_catalog_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Template>, AppError> {
    state
        .engine
        .template(&id)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("template '{id}' not found")).into())
}

// ============================================================================
// Deployment requests
// ============================================================================

#[derive(Debug, Deserialize)]
struct ScopeQuery {
    /// List every user's entities; requires the approver role.
    #[serde(default)]
    all: bool,
}

async fn submit_request(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(body): Json<SubmitRequestBody>,
) -> Result<(StatusCode, Json<DeploymentRequest>), AppError> {
    let request = state.engine.submit_request(&caller, body).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_requests(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<Vec<RequestView>>, AppError> {
    Ok(Json(state.engine.list_requests(&caller, scope.all).await?))
}

async fn get_request(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<RequestView>, AppError> {
    Ok(Json(state.engine.get_request_view(&caller, id).await?))
}

async fn approve_request(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<DeploymentRequest>, AppError> {
    Ok(Json(state.engine.approve_request(&caller, id).await?))
}

async fn reject_request(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> Result<Json<DeploymentRequest>, AppError> {
    Ok(Json(state.engine.reject_request(&caller, id, body).await?))
}

// ============================================================================
// Deployments & operations
// ============================================================================

async fn list_deployments(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<Vec<DeploymentView>>, AppError> {
    Ok(Json(state.engine.list_deployments(&caller, scope.all).await?))
}

async fn get_deployment(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<DeploymentView>, AppError> {
    Ok(Json(state.engine.get_deployment_view(&caller, id).await?))
}

async fn submit_scale(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<ScaleBody>,
) -> Result<(StatusCode, Json<Operation>), AppError> {
    let operation = state.engine.submit_scale(&caller, id, body).await?;
    Ok((StatusCode::CREATED, Json(operation)))
}

async fn submit_destroy(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<DestroyBody>,
) -> Result<(StatusCode, Json<Operation>), AppError> {
    let operation = state.engine.submit_destroy(&caller, id, body).await?;
    Ok((StatusCode::CREATED, Json(operation)))
}

async fn list_operations(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Operation>>, AppError> {
    Ok(Json(state.engine.list_operations(&caller, id).await?))
}

async fn get_operation(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Operation>, AppError> {
    Ok(Json(state.engine.get_operation(&caller, id).await?))
}

async fn approve_operation(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Operation>, AppError> {
    Ok(Json(state.engine.approve_operation(&caller, id).await?))
}

async fn reject_operation(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> Result<Json<Operation>, AppError> {
    Ok(Json(state.engine.reject_operation(&caller, id, body).await?))
}

// ============================================================================
// Audit
// ============================================================================

async fn list_audit(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    let kind: SubjectKind = kind
        .parse()
        .map_err(|_| Error::Validation(format!("unknown audit subject kind '{kind}'")))?;
    Ok(Json(state.engine.list_audit(&caller, kind, id).await?))
}

// ============================================================================
// Pipeline callback
// ============================================================================

async fn pipeline_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CallbackBody>,
) -> Result<StatusCode, AppError> {
    if let Some(secret) = &state.callback_secret {
        let presented = headers
            .get(CALLBACK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            return Err(AppError::Unauthenticated(
                "invalid pipeline callback secret".to_string(),
            ));
        }
    }

    state
        .engine
        .pipeline_callback(body.correlation_token, body.outcome, body.detail)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use launchpad_engine::{
        CatalogRegistry, Dispatcher, MemStore, PipelineGateway, PipelineRunState, YamlCatalog,
    };
    use launchpad_models::{ParameterValues, PipelineRunRef};
    use tower::util::ServiceExt;

    use super::*;

    struct DownGateway;

    #[async_trait]
    impl PipelineGateway for DownGateway {
        async fn trigger(
            &self,
            _binding: &launchpad_engine::catalog::PipelineBinding,
            _parameters: &ParameterValues,
            _correlation: Uuid,
        ) -> launchpad_models::Result<PipelineRunRef> {
            Err(Error::PipelineUnavailable("down".to_string()))
        }

        async fn poll(
            &self,
            _binding: &launchpad_engine::catalog::PipelineBinding,
            _run: &PipelineRunRef,
        ) -> launchpad_models::Result<PipelineRunState> {
            Ok(PipelineRunState::Running)
        }
    }

    fn router(callback_secret: Option<&str>) -> Router {
        let store = Arc::new(MemStore::new());
        let catalog: Arc<dyn CatalogRegistry> =
            Arc::new(YamlCatalog::from_templates(Vec::new()));
        let dispatcher = Dispatcher::new(store.clone(), Vec::new());
        let engine = LifecycleEngine::new(
            store,
            catalog,
            Arc::new(DownGateway),
            dispatcher,
            None,
            Vec::new(),
        );
        create_router(AppState {
            engine: Arc::new(engine),
            callback_secret: callback_secret.map(|s| s.to_string()),
        })
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = router(None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn requests_require_an_identity() {
        let response = router(None)
            .oneshot(Request::get("/api/requests").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn callback_rejects_a_bad_secret() {
        let body = serde_json::json!({
            "correlation_token": Uuid::new_v4(),
            "outcome": "success",
        });
        let response = router(Some("s3cret"))
            .oneshot(
                Request::post("/api/pipeline/callback")
                    .header("content-type", "application/json")
                    .header(CALLBACK_SECRET_HEADER, "wrong")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_correlation_token_is_not_found() {
        let body = serde_json::json!({
            "correlation_token": Uuid::new_v4(),
            "outcome": "success",
        });
        let response = router(None)
            .oneshot(
                Request::post("/api/pipeline/callback")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
