//! Axum JSON API over the operations dashboard.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use opsdash_adapters::rows_from_payload;
use opsdash_core::{DailySnapshot, ProcessingRun, Summary};
use opsdash_sync::{
    ComplaintReport, Dashboard, DashboardError, DashboardRules, IngestReport, OecSalesReport, PnlConfig,
    PnlReport, ResetReport, ResetScope, UploadReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "opsdash-web";

#[derive(Clone)]
pub struct AppState {
    pub dashboard: Arc<Dashboard>,
    /// Bearer token required on `/api`; `None` leaves the API open.
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(dashboard: Arc<Dashboard>, api_token: Option<String>) -> Self {
        Self { dashboard, api_token }
    }
}

/// JSON error body with the status code it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<DashboardError> for ApiError {
    fn from(err: DashboardError) -> Self {
        let status = match &err {
            DashboardError::Busy { .. } => StatusCode::CONFLICT,
            DashboardError::NotFound { .. } => StatusCode::NOT_FOUND,
            DashboardError::InvalidDate(_) | DashboardError::InvalidRange { .. } | DashboardError::Adapter(_) => {
                StatusCode::BAD_REQUEST
            }
            DashboardError::ClassifierUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DashboardError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<opsdash_adapters::AdapterError> for ApiError {
    fn from(err: opsdash_adapters::AdapterError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(ErrorBody { error: &self.message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: String,
    to: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResetBody {
    #[serde(default)]
    scope: ResetScope,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let api = Router::new()
        .route("/daily", get(list_dates_handler))
        .route("/daily/{date}", get(snapshot_handler).delete(delete_snapshot_handler))
        .route("/daily/{date}/ingest", post(ingest_handler))
        .route("/daily/{date}/process", post(process_handler))
        .route("/daily/{date}/reset", post(reset_handler))
        .route("/daily/{date}/summary", get(summary_handler))
        .route("/oec/sales", get(oec_sales_handler))
        .route("/oec/{date}", post(oec_upload_handler))
        .route("/complaints/{date}", post(complaints_upload_handler))
        .route("/complaints/report", get(complaint_report_handler))
        .route("/pnl", get(pnl_handler))
        .route("/config/dashboard", get(get_rules_handler).put(put_rules_handler))
        .route("/config/pnl", get(get_pnl_handler).put(put_pnl_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn require_token(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        next.run(req).await
    } else {
        ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response()
    }
}

async fn health_handler() -> Json<JsonValue> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn list_dates_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<String>> {
    Ok(Json(state.dashboard.list_dates().await?))
}

async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> ApiResult<DailySnapshot> {
    Ok(Json(state.dashboard.get_snapshot(&date).await?))
}

async fn delete_snapshot_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    state.dashboard.delete_date(&date).await?;
    info!(%date, "snapshot deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    Json(payload): Json<JsonValue>,
) -> ApiResult<IngestReport> {
    let rows = rows_from_payload(&payload)?;
    Ok(Json(state.dashboard.ingest_conversations(&date, rows).await?))
}

async fn process_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> ApiResult<ProcessingRun> {
    Ok(Json(state.dashboard.process_date(&date).await?))
}

/// An empty body resets failed records only.
async fn reset_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    body: Bytes,
) -> ApiResult<ResetReport> {
    let body: ResetBody = if body.iter().all(u8::is_ascii_whitespace) {
        ResetBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid reset body: {err}")))?
    };
    Ok(Json(state.dashboard.reset_date(&date, body.scope).await?))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> ApiResult<Summary> {
    Ok(Json(state.dashboard.snapshot_summary(&date).await?))
}

async fn oec_upload_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    Json(payload): Json<JsonValue>,
) -> ApiResult<UploadReport> {
    let rows = rows_from_payload(&payload)?;
    Ok(Json(state.dashboard.upload_oec_rows(&date, rows).await?))
}

async fn oec_sales_handler(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<OecSalesReport> {
    Ok(Json(state.dashboard.oec_sales_report(&range.from, &range.to).await?))
}

async fn complaints_upload_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    Json(payload): Json<JsonValue>,
) -> ApiResult<UploadReport> {
    let rows = rows_from_payload(&payload)?;
    Ok(Json(state.dashboard.upload_complaints(&date, rows).await?))
}

async fn complaint_report_handler(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<ComplaintReport> {
    Ok(Json(state.dashboard.complaint_report(&range.from, &range.to).await?))
}

async fn pnl_handler(State(state): State<Arc<AppState>>, Query(range): Query<RangeQuery>) -> ApiResult<PnlReport> {
    Ok(Json(state.dashboard.pnl_report(&range.from, &range.to).await?))
}

async fn get_rules_handler(State(state): State<Arc<AppState>>) -> ApiResult<DashboardRules> {
    Ok(Json(state.dashboard.effective_rules().await?))
}

async fn put_rules_handler(
    State(state): State<Arc<AppState>>,
    Json(rules): Json<DashboardRules>,
) -> ApiResult<DashboardRules> {
    state.dashboard.save_rules(&rules).await?;
    info!(categories = rules.aggregator.categories.len(), "dashboard config override saved");
    Ok(Json(rules))
}

async fn get_pnl_handler(State(state): State<Arc<AppState>>) -> ApiResult<PnlConfig> {
    Ok(Json(state.dashboard.effective_pnl().await?))
}

async fn put_pnl_handler(State(state): State<Arc<AppState>>, Json(pnl): Json<PnlConfig>) -> ApiResult<PnlConfig> {
    state.dashboard.save_pnl(&pnl).await?;
    info!(currency = %pnl.currency, "P&L config override saved");
    Ok(Json(pnl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use opsdash_storage::MemoryDocumentStore;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    fn test_app(token: Option<&str>) -> Router {
        let dashboard = Dashboard::new(Arc::new(MemoryDocumentStore::new()));
        app(AppState::new(Arc::new(dashboard), token.map(str::to_string)))
    }

    fn request(method: &str, uri: &str, body: Option<JsonValue>) -> axum::http::Request<Body> {
        let builder = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_is_open_and_api_requires_the_token() {
        let app = test_app(Some(TOKEN));
        let health = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let anonymous = app
            .clone()
            .oneshot(axum::http::Request::builder().uri("/api/daily").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        assert!(json_body(anonymous).await["error"].as_str().unwrap().contains("bearer"));

        let authorised = app.oneshot(request("GET", "/api/daily", None)).await.unwrap();
        assert_eq!(authorised.status(), StatusCode::OK);
        assert_eq!(json_body(authorised).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn ingest_then_read_snapshot_and_reset() {
        let app = test_app(Some(TOKEN));
        let rows = serde_json::json!({"conversations": [
            {"conversationId": "c-1", "clientId": "C-1", "date": "2026-01-10 08:00:00"},
            {"conversationId": "c-2", "clientId": "C-2", "date": "2026-01-10 09:00:00"}
        ]});
        let ingest = app
            .clone()
            .oneshot(request("POST", "/api/daily/2026-01-10/ingest", Some(rows)))
            .await
            .unwrap();
        assert_eq!(ingest.status(), StatusCode::OK);
        assert_eq!(json_body(ingest).await["added"], 2);

        let snapshot = app
            .clone()
            .oneshot(request("GET", "/api/daily/2026-01-10", None))
            .await
            .unwrap();
        assert_eq!(snapshot.status(), StatusCode::OK);
        let snapshot = json_body(snapshot).await;
        assert_eq!(snapshot["total_records"], 2);
        assert_eq!(snapshot["records"][0]["status"]["state"], "pending");

        let reset = app
            .clone()
            .oneshot(request("POST", "/api/daily/2026-01-10/reset", Some(serde_json::json!({"scope": "all"}))))
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);
        assert_eq!(json_body(reset).await["scope"], "all");

        let default_reset = app
            .oneshot(request("POST", "/api/daily/2026-01-10/reset", None))
            .await
            .unwrap();
        assert_eq!(json_body(default_reset).await["scope"], "failed");
    }

    #[tokio::test]
    async fn domain_errors_map_to_status_codes() {
        let app = test_app(None);
        let bad_date = app
            .clone()
            .oneshot(request("GET", "/api/daily/2026-13-01", None))
            .await
            .unwrap();
        assert_eq!(bad_date.status(), StatusCode::BAD_REQUEST);

        let missing = app
            .clone()
            .oneshot(request("GET", "/api/daily/2026-01-10", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let no_classifier = app
            .clone()
            .oneshot(request("POST", "/api/daily/2026-01-10/process", None))
            .await
            .unwrap();
        assert_eq!(no_classifier.status(), StatusCode::SERVICE_UNAVAILABLE);

        let reversed = app
            .clone()
            .oneshot(request("GET", "/api/pnl?from=2026-03-01&to=2026-01-01", None))
            .await
            .unwrap();
        assert_eq!(reversed.status(), StatusCode::BAD_REQUEST);

        let not_rows = app
            .oneshot(request("POST", "/api/oec/2026-01-10", Some(serde_json::json!("nope"))))
            .await
            .unwrap();
        assert_eq!(not_rows.status(), StatusCode::BAD_REQUEST);

        let busy = ApiError::from(DashboardError::Busy {
            date: "2026-01-10".into(),
        });
        assert_eq!(busy.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn oec_upload_feeds_the_sales_report() {
        let app = test_app(None);
        let rows = serde_json::json!([
            {"Sale ID": "s-1", "Client ID": "C-1", "Type": "Overseas Employment Certificate", "Sale Date": "2026-01-10"},
            {"Sale ID": "s-2", "Client ID": "C-1", "Type": "Overseas Employment Certificate", "Sale Date": "2026-02-10"}
        ]);
        let upload = app
            .clone()
            .oneshot(request("POST", "/api/oec/2026-02-10", Some(rows)))
            .await
            .unwrap();
        assert_eq!(upload.status(), StatusCode::OK);

        let report = app
            .oneshot(request("GET", "/api/oec/sales?from=2026-01-01&to=2026-03-31", None))
            .await
            .unwrap();
        assert_eq!(report.status(), StatusCode::OK);
        assert_eq!(json_body(report).await["total_sales"], 1);
    }

    #[tokio::test]
    async fn pnl_config_override_round_trips() {
        let app = test_app(None);
        let custom = serde_json::json!({
            "currency": "USD",
            "sales": {"Travel Visa": {"unit_revenue": 100.0, "unit_cost": 60.0}},
            "complaints": {},
            "default_complaint_cost": 5.0
        });
        let put = app
            .clone()
            .oneshot(request("PUT", "/api/config/pnl", Some(custom)))
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::OK);

        let got = json_body(app.oneshot(request("GET", "/api/config/pnl", None)).await.unwrap()).await;
        assert_eq!(got["currency"], "USD");
        assert_eq!(got["sales"]["Travel Visa"]["unit_cost"], 60.0);
    }
}
