use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use taxonomy_sync_api::{
    init_logging, load_config, receive_error_status, NoticeView, TaxonomySyncApi, TermMutation,
    API_CONTRACT_VERSION,
};
use taxonomy_sync_core::{FullSyncError, ReceiveRequest, SyncRole, Term, TermArgs, SYNC_PATH};
use taxonomy_sync_store_sqlite::{is_storage_failure, SchemaStatus};
use tracing::{debug, info, warn};

mod nonce;

use nonce::{IssuedNonce, NonceRegistry};

const SERVICE_CONTRACT_VERSION: &str = "taxonomy-sync.service.v1";
const FULL_SYNC_NONCE_FIELD: &str = "taxonomy_sync_full_sync_nonce";

#[derive(Clone)]
struct ServiceState {
    api: TaxonomySyncApi,
    nonces: Arc<NonceRegistry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    role: SyncRole,
    receiving: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NonceForm {
    key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FullSyncForm {
    taxonomy_sync_full_sync_nonce: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "taxonomy-sync-service")]
#[command(about = "HTTP endpoints for taxonomy term synchronization")]
struct Args {
    #[arg(long, default_value = "./taxonomy_sync.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "./taxonomy_sync.yaml")]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn new(api: TaxonomySyncApi) -> Self {
        Self { api, nonces: Arc::new(NonceRegistry::default()) }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

/// Run store and network work off the async executor. SQLite failures map to 500, anything
/// else the API rejects maps to 400.
async fn blocking<T, F>(task: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            let status = if is_storage_failure(&err) {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            };
            Err(ServiceState::error(status, format!("{err:#}")))
        }
        Err(err) => Err(ServiceState::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("worker task failed: {err}"),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    let mut router = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/admin/notices", get(admin_notices))
        .route("/v1/admin/full-sync/nonce", post(full_sync_nonce))
        .route("/v1/admin/full-sync", post(full_sync))
        .route("/v1/taxonomies/:taxonomy/terms", get(terms_list).post(terms_create))
        .route("/v1/taxonomies/:taxonomy/terms/:term_id", post(terms_update));

    if state.api.config().role == SyncRole::Slave {
        router = router.route(&format!("/{SYNC_PATH}"), post(receive));
    }

    router.with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info")?;
    let args = Args::parse();
    let config = load_config(&args.config)?;
    for notice in config.notices() {
        warn!(code = ?notice, "{}", notice.message());
    }

    let role = config.role;
    let state = ServiceState::new(TaxonomySyncApi::new(args.db, config));
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, role = role.as_str(), "taxonomy sync service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let role = state.api.config().role;
    Json(envelope(HealthResponse { status: "ok", role, receiving: role == SyncRole::Slave }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let api = state.api.clone();
    let status = blocking(move || api.schema_status()).await?;
    Ok(Json(envelope(status)))
}

async fn admin_notices(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<Vec<NoticeView>>> {
    Json(envelope(state.api.notices()))
}

async fn receive(
    State(state): State<ServiceState>,
    Form(request): Form<ReceiveRequest>,
) -> Response {
    let api = state.api.clone();
    match tokio::task::spawn_blocking(move || api.receive(&request)).await {
        Ok(Ok(outcome)) => text(StatusCode::OK, outcome.local_term_id.to_string()),
        Ok(Err(err)) => {
            debug!(%err, "term rejected");
            let status = StatusCode::from_u16(receive_error_status(&err))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            text(status, err.to_string())
        }
        Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("worker task failed: {err}")),
    }
}

/// Nonces are only handed to callers holding the shared key.
async fn full_sync_nonce(
    State(state): State<ServiceState>,
    Form(form): Form<NonceForm>,
) -> Result<Json<ServiceEnvelope<IssuedNonce>>, ServiceError> {
    if !state.api.config().key_matches(form.key.as_deref().unwrap_or_default()) {
        return Err(ServiceState::error(StatusCode::FORBIDDEN, "Invalid key specified"));
    }
    let issued = state
        .nonces
        .issue()
        .map_err(|err| ServiceState::error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    Ok(Json(envelope(issued)))
}

async fn full_sync(State(state): State<ServiceState>, Form(form): Form<FullSyncForm>) -> Response {
    let nonce = form.taxonomy_sync_full_sync_nonce.unwrap_or_default();
    match state.nonces.consume(&nonce) {
        Ok(true) => {}
        Ok(false) => {
            debug!(field = FULL_SYNC_NONCE_FIELD, "full sync refused: invalid nonce");
            return text(StatusCode::FORBIDDEN, "Invalid or expired full sync nonce");
        }
        Err(err) => return text(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }

    let api = state.api.clone();
    match tokio::task::spawn_blocking(move || api.full_sync()).await {
        Ok(Ok(report)) => text(StatusCode::OK, report.render_text()),
        Ok(Err(err)) => match err.downcast_ref::<FullSyncError>() {
            Some(precondition) => text(StatusCode::CONFLICT, precondition.to_string()),
            None => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
        },
        Err(err) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("worker task failed: {err}")),
    }
}

async fn terms_list(
    State(state): State<ServiceState>,
    Path(taxonomy): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<Term>>>, ServiceError> {
    let api = state.api.clone();
    let terms = blocking(move || api.list_terms(&taxonomy)).await?;
    Ok(Json(envelope(terms)))
}

async fn terms_create(
    State(state): State<ServiceState>,
    Path(taxonomy): Path<String>,
    Json(args): Json<TermArgs>,
) -> Result<Json<ServiceEnvelope<TermMutation>>, ServiceError> {
    let api = state.api.clone();
    let mutation = blocking(move || api.create_term(&taxonomy, &args)).await?;
    Ok(Json(envelope(mutation)))
}

async fn terms_update(
    State(state): State<ServiceState>,
    Path((taxonomy, term_id)): Path<(String, i64)>,
    Json(args): Json<TermArgs>,
) -> Result<Json<ServiceEnvelope<TermMutation>>, ServiceError> {
    let api = state.api.clone();
    let mutation = blocking(move || api.update_term(term_id, &taxonomy, &args)).await?;
    Ok(Json(envelope(mutation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use taxonomy_sync_core::{SyncConfig, TaxonomyDescriptor};
    use tower::ServiceExt;

    struct TempDb(PathBuf);

    impl TempDb {
        fn new() -> Self {
            let name = format!("taxonomy-sync-service-{}.sqlite3", ulid::Ulid::new());
            Self(std::env::temp_dir().join(name))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{}", self.0.display(), suffix));
            }
        }
    }

    fn slave_state(db: &TempDb) -> ServiceState {
        let config = SyncConfig::new(SyncRole::Slave, "s3cret", None, vec!["genre".to_string()]);
        let api = TaxonomySyncApi::new(db.0.clone(), config);
        if let Err(err) = api.register_taxonomy(&TaxonomyDescriptor {
            name: "genre".to_string(),
            label: "Genre".to_string(),
            public: true,
            show_ui: true,
        }) {
            panic!("failed to register taxonomy: {err:#}");
        }
        ServiceState::new(api)
    }

    fn form_request(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn receive_body(key: &str, taxonomy: &str, name: &str) -> String {
        let term = format!(
            concat!(
                r#"{{"term_id":7,"taxonomy":"{}","name":"{}","#,
                r#""slug":"","description":"","parent":0}}"#
            ),
            taxonomy, name
        );
        format!("key={}&taxonomy={}&term={}", encode(key), encode(taxonomy), encode(&term))
    }

    fn encode(value: &str) -> String {
        value
            .bytes()
            .map(|byte| match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                    (byte as char).to_string()
                }
                _ => format!("%{byte:02X}"),
            })
            .collect()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => (status, body),
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    fn json(body: &str) -> serde_json::Value {
        match serde_json::from_str(body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_role() {
        let db = TempDb::new();
        let router = app(slave_state(&db));
        let (status, body) = send(router, get_request("/v1/health")).await;
        assert_eq!(status, StatusCode::OK);

        let value = json(&body);
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/role").and_then(serde_json::Value::as_str), Some("slave"));
        assert_eq!(value.pointer("/data/receiving"), Some(&serde_json::Value::Bool(true)));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn receive_route_returns_same_local_id_on_redelivery() {
        let db = TempDb::new();
        let router = app(slave_state(&db));

        let (status, first) = send(
            router.clone(),
            form_request("/taxonomy_sync_receive_term", receive_body("s3cret", "genre", "Jazz")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let local_id = first.trim().parse::<i64>().unwrap_or_else(|err| panic!("{err}: {first}"));

        let (status, second) = send(
            router.clone(),
            form_request(
                "/taxonomy_sync_receive_term",
                receive_body("s3cret", "genre", "Jazz Fusion"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, local_id.to_string());

        let (status, body) = send(router, get_request("/v1/taxonomies/genre/terms")).await;
        assert_eq!(status, StatusCode::OK);
        let value = json(&body);
        assert_eq!(
            value.pointer("/data/0/name").and_then(serde_json::Value::as_str),
            Some("Jazz Fusion")
        );
        assert_eq!(value.pointer("/data/1"), None);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn receive_route_maps_rejections_to_statuses() {
        let db = TempDb::new();
        let router = app(slave_state(&db));

        let (status, body) = send(
            router.clone(),
            form_request("/taxonomy_sync_receive_term", receive_body("wrong", "post_tag", "Jazz")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Invalid key specified");

        let (status, body) = send(
            router.clone(),
            form_request("/taxonomy_sync_receive_term", receive_body("s3cret", "post_tag", "Jazz")),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body, "Taxonomy not specified for synchronization at slave site");

        let (status, body) = send(
            router,
            form_request("/taxonomy_sync_receive_term", "key=s3cret&taxonomy=genre".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body, "Term not included in the request");
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn receive_route_is_absent_on_master() {
        let db = TempDb::new();
        let config = SyncConfig::new(
            SyncRole::Master,
            "s3cret",
            Some("http://127.0.0.1:9".to_string()),
            vec!["genre".to_string()],
        );
        let router = app(ServiceState::new(TaxonomySyncApi::new(db.0.clone(), config)));
        let (status, _) = send(
            router,
            form_request("/taxonomy_sync_receive_term", receive_body("s3cret", "genre", "Jazz")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn full_sync_requires_a_fresh_nonce_each_time() {
        let db = TempDb::new();
        let router = app(slave_state(&db));

        let (status, body) = send(
            router.clone(),
            form_request("/v1/admin/full-sync", format!("{FULL_SYNC_NONCE_FIELD}=bogus")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Invalid or expired full sync nonce");

        let (status, _) =
            send(router.clone(), form_request("/v1/admin/full-sync/nonce", String::new())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let wrong_key = form_request("/v1/admin/full-sync/nonce", "key=wrong".to_string());
        let (status, _) = send(router.clone(), wrong_key).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let with_key = form_request("/v1/admin/full-sync/nonce", "key=s3cret".to_string());
        let (status, body) = send(router.clone(), with_key).await;
        assert_eq!(status, StatusCode::OK);
        let nonce = json(&body)
            .pointer("/data/nonce")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| panic!("nonce missing from {body}"));

        let submit = format!("{FULL_SYNC_NONCE_FIELD}={nonce}");
        let (status, body) =
            send(router.clone(), form_request("/v1/admin/full-sync", submit.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, "Cannot run full synchronization since this is not the master site.");

        let (status, _) = send(router, form_request("/v1/admin/full-sync", submit)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn notices_and_term_editing_endpoints() {
        let db = TempDb::new();
        let api = TaxonomySyncApi::new(db.0.clone(), SyncConfig::default());
        if let Err(err) = api.register_taxonomy(&TaxonomyDescriptor {
            name: "genre".to_string(),
            label: "Genre".to_string(),
            public: true,
            show_ui: true,
        }) {
            panic!("failed to register taxonomy: {err:#}");
        }
        let router = app(ServiceState::new(api));

        let (status, body) = send(router.clone(), get_request("/v1/admin/notices")).await;
        assert_eq!(status, StatusCode::OK);
        let notices = json(&body);
        assert_eq!(
            notices.pointer("/data/0/code").and_then(serde_json::Value::as_str),
            Some("missing_shared_key")
        );

        let create = Request::builder()
            .uri("/v1/taxonomies/genre/terms")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"Jazz","slug":"","description":"","parent":null}"#))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let (status, body) = send(router.clone(), create).await;
        assert_eq!(status, StatusCode::OK);
        let created = json(&body);
        let term_id = created
            .pointer("/data/term/term_id")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_else(|| panic!("term id missing from {body}"));
        assert_eq!(created.pointer("/data/dispatch"), Some(&serde_json::Value::Null));

        let edit = Request::builder()
            .uri(format!("/v1/taxonomies/genre/terms/{term_id}"))
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"","slug":"","description":"","parent":null}"#))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let (status, body) = send(router, edit).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("A name is required for this term."));
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn schema_status_route_and_storage_failures_map_to_500() {
        let db = TempDb::new();
        let router = app(slave_state(&db));
        let (status, body) =
            send(router, form_request("/v1/db/schema-version", String::new())).await;
        assert_eq!(status, StatusCode::OK);
        let value = json(&body);
        assert_eq!(value.pointer("/data/pending_versions"), Some(&serde_json::json!([])));

        let unreachable = std::env::temp_dir()
            .join(format!("taxonomy-sync-missing-{}", ulid::Ulid::new()))
            .join("sync.sqlite3");
        let api = TaxonomySyncApi::new(unreachable, SyncConfig::default());
        let (status, body) =
            send(app(ServiceState::new(api)), get_request("/v1/taxonomies/genre/terms")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("failed to open sqlite database"));
    }
}
