//! Authenticated HTTP surface over the ingestion pipeline.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tabula_core::{ManifestEntry, SourceId};
use tabula_sync::{maybe_build_scheduler, Pipeline, SyncConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "tabula-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Bearer token for every route except health. Unset rejects all callers.
    pub ingest_token: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, ingest_token: Option<String>) -> Self {
        Self {
            pipeline,
            ingest_token,
        }
    }
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let protected = Router::new()
        .route("/api/manifest", post(manifest_handler))
        .route("/api/ingest", post(ingest_handler))
        .route("/api/status", get(status_handler))
        .route("/api/trigger", post(trigger_handler))
        .route("/api/known-urls", get(known_urls_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_bearer));

    Router::new()
        .route("/api/health", get(health_handler))
        .merge(protected)
        .fallback(not_found)
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    if config.ingest_token.is_none() {
        warn!("TABULA_INGEST_TOKEN is not set; authenticated routes will reject every request");
    }
    let pipeline = Arc::new(Pipeline::from_config(&config).await?);

    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    let state = AppState::new(pipeline, config.ingest_token.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "serving http");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("could not install ctrl-c handler");
            }
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn require_bearer(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match (state.ingest_token.as_deref(), presented) {
        (Some(expected), Some(token)) if token == expected => next.run(req).await,
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response(),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    let message = format!("{err:#}");
    error!(error = %message, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response()
}

#[derive(Debug, Deserialize)]
struct ManifestPayload {
    #[serde(default)]
    entries: Vec<ManifestEntry>,
}

async fn manifest_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ManifestPayload>,
) -> Response {
    info!(entries = payload.entries.len(), "manifest received");
    let summary = state.pipeline.ingest_manifest(payload.entries).await;
    Json(json!({
        "processed": summary.processed,
        "errors": summary.errors.len(),
        "pdf_requests": summary.pdf_requests,
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct IngestStats {
    #[serde(default)]
    total: u32,
    #[serde(default)]
    success: u32,
    #[serde(default)]
    failed: u32,
}

#[derive(Debug, Deserialize)]
struct IngestPayload {
    event: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    results: Vec<String>,
    #[serde(default)]
    stats: IngestStats,
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IngestPayload>,
) -> Response {
    if payload.event != "extraction_complete" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown event type `{}`", payload.event) })),
        )
            .into_response();
    }
    info!(
        run_id = payload.run_id.as_deref().unwrap_or(""),
        results = payload.results.len(),
        total = payload.stats.total,
        success = payload.stats.success,
        failed = payload.stats.failed,
        "worker reported extraction complete"
    );
    let outcome = state.pipeline.run_pickup().await;
    Json(json!({
        "processed": outcome.processed,
        "errors": outcome.errors.len(),
    }))
    .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.latest_run().await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "no pipeline runs found" })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(run) => Json(json!({
            "run_id": run.id,
            "status": run.status,
            "sources_checked": run.sources_checked,
            "files_discovered": run.files_discovered,
            "files_downloaded": run.files_downloaded,
            "files_extracted": run.files_extracted,
            "extraction_requests_created": run.extraction_requests_created,
            "extraction_results_processed": run.extraction_results_processed,
            "errors": run.errors.len(),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

/// `source` may repeat or carry a comma-separated list; unknown names are ignored.
fn requested_sources(params: &[(String, String)]) -> Option<Vec<SourceId>> {
    let names: Vec<&str> = params
        .iter()
        .filter(|(key, _)| key == "source")
        .flat_map(|(_, value)| value.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        return None;
    }
    let mut sources = Vec::new();
    for name in names {
        match name.parse::<SourceId>() {
            Ok(source) if !sources.contains(&source) => sources.push(source),
            Ok(_) => {}
            Err(_) => warn!(source = name, "ignoring unknown source"),
        }
    }
    Some(sources)
}

async fn known_urls_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let sources = match requested_sources(&params) {
        Some(sources) if sources.is_empty() => {
            return Json(json!({ "urls": Vec::<String>::new(), "count": 0 })).into_response();
        }
        Some(sources) => sources,
        None => Vec::new(),
    };
    match state.pipeline.known_urls(&sources).await {
        Ok(urls) => {
            let count = urls.len();
            Json(json!({ "urls": urls, "count": count })).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.last_run_at().await {
        Ok(last_run) => Json(json!({
            "status": "ok",
            "last_run": last_run.unwrap_or_else(|| "never".to_string()),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tabula_storage::{HttpClientConfig, HttpFetcher};
    use tabula_sync::{DiscoveryCoordinator, ExtractionRouter, NoopNotifier, Stores};
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    const CPI_XML: &str = r#"<indices UpdateDate="15/02/2026">
  <date year="2026" month="ינואר">
    <code code="120010">
      <name>מדד המחירים לצרכן - כללי</name>
      <index base="2024 ממוצע">103.3</index>
    </code>
  </date>
</indices>"#;

    fn test_app() -> Router {
        let stores = Stores::in_memory();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let discovery =
            DiscoveryCoordinator::new(Vec::new(), Arc::clone(&http), Arc::clone(&stores.kv));
        let pipeline = Pipeline::new(
            stores,
            http,
            discovery,
            ExtractionRouter::standard().unwrap(),
            Arc::new(NoopNotifier),
        );
        app(AppState::new(Arc::new(pipeline), Some(TOKEN.to_string())))
    }

    fn get(uri: &str, token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, req: HttpRequest<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn cpi_entry() -> Value {
        json!({
            "source": "cbs-xml-api",
            "url": "https://api.cbs.example/index/data/price_selected?format=xml",
            "filename": "price_selected_2026-02-15.xml",
            "format": "xml",
            "publication_id": "cbs-xml-api-2026-ינואר",
            "publish_date": "2026-02-15T00:00:00Z",
            "inline_content": CPI_XML
        })
    }

    #[tokio::test]
    async fn health_is_public_and_reports_never_before_any_run() {
        let app = test_app();
        let (status, body) = send(&app, get("/api/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "last_run": "never"}));
    }

    #[tokio::test]
    async fn protected_routes_require_the_bearer_token() {
        let app = test_app();
        for uri in ["/api/status", "/api/known-urls"] {
            let (status, _) = send(&app, get(uri, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            let (status, _) = send(&app, get(uri, Some("wrong"))).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn status_is_not_found_until_a_run_exists() {
        let app = test_app();
        let (status, body) = send(&app, get("/api/status", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].is_string());

        let (status, body) = send(&app, post_json("/api/trigger", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["files_discovered"], 0);

        let (status, latest) = send(&app, get("/api/status", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["id"], body["run_id"]);

        let (_, health) = send(&app, get("/api/health", None)).await;
        assert_ne!(health["last_run"], "never");
    }

    #[tokio::test]
    async fn manifest_ingests_once_and_known_urls_reflect_it() {
        let app = test_app();
        let payload = json!({ "entries": [cpi_entry()] });

        let (status, body) = send(&app, post_json("/api/manifest", payload.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"processed": 1, "errors": 0, "pdf_requests": 0}));

        let (_, again) = send(&app, post_json("/api/manifest", payload)).await;
        assert_eq!(again, json!({"processed": 0, "errors": 0, "pdf_requests": 0}));

        let (status, known) = send(&app, get("/api/known-urls?source=cbs-xml-api", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(known["count"], 1);

        let (_, other) = send(&app, get("/api/known-urls?source=cbs-media", Some(TOKEN))).await;
        assert_eq!(other["count"], 0);

        let (_, unknown) = send(&app, get("/api/known-urls?source=nowhere", Some(TOKEN))).await;
        assert_eq!(unknown, json!({"urls": [], "count": 0}));

        let (_, all) = send(&app, get("/api/known-urls", Some(TOKEN))).await;
        assert_eq!(all["count"], 1);
    }

    #[tokio::test]
    async fn empty_manifest_is_a_no_op() {
        let app = test_app();
        let (status, body) = send(&app, post_json("/api/manifest", json!({ "entries": [] }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"processed": 0, "errors": 0, "pdf_requests": 0}));
    }

    #[tokio::test]
    async fn ingest_accepts_only_extraction_complete() {
        let app = test_app();
        let (status, body) = send(&app, post_json("/api/ingest", json!({"event": "ping"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, body) = send(
            &app,
            post_json(
                "/api/ingest",
                json!({
                    "event": "extraction_complete",
                    "run_id": "2026-03-01-ab12cd34",
                    "results": ["req-2026-03-01-ab12cd34-001"],
                    "stats": {"total": 1, "success": 1, "failed": 0}
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"processed": 0, "errors": 0}));
    }

    #[test]
    fn source_filters_accept_repeats_and_lists() {
        let params = vec![
            ("source".to_string(), "cbs-media,cbs-publications".to_string()),
            ("source".to_string(), "cbs-media".to_string()),
            ("other".to_string(), "gov-il-reviews".to_string()),
        ];
        assert_eq!(
            requested_sources(&params),
            Some(vec![SourceId::CbsMedia, SourceId::CbsPublications])
        );
        assert_eq!(requested_sources(&[]), None);
    }
}
