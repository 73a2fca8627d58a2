use crate::errors::ApiError;
use crate::models::*;
use crate::state::AppState;
use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use club_core::types::{MemberAddress, NewInvestment, RecordId};
use club_core::ClubStatistics;
use tower_http::cors::{Any, CorsLayer};

const MEMBER_HEADER: &str = "X-Member-Address";

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/v1/investments", post(create_investment))
        .route("/api/v1/investments/:id/verify", post(verify_investment))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/availability", get(availability))
        .route("/api/v1/status", get(current_status))
        .route("/api/v1/investments", get(list_investments))
        .route("/api/v1/investments/:id", get(get_investment))
        .route("/api/v1/stats", get(statistics))
        .merge(protected_routes)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(provided_key) = headers.get("X-API-KEY") {
        if provided_key == state.config.api_key.as_str() {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!("unauthorized access attempt");
    Err(ApiError::Unauthorized)
}

fn member_from(headers: &HeaderMap) -> Result<Option<MemberAddress>, ApiError> {
    let Some(value) = headers.get(MEMBER_HEADER) else {
        return Ok(None);
    };
    let member = value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{MEMBER_HEADER} must be ascii")))?
        .trim();
    if member.is_empty() {
        return Ok(None);
    }
    Ok(Some(MemberAddress::from(member)))
}

fn require_member(headers: &HeaderMap) -> Result<MemberAddress, ApiError> {
    member_from(headers)?.ok_or_else(|| ApiError::BadRequest("Please connect wallet".to_string()))
}

async fn availability(State(state): State<AppState>) -> Result<Json<AvailabilityResponse>, ApiError> {
    let available = state.viewer().check_available().await?;
    Ok(Json(AvailabilityResponse { available }))
}

async fn current_status(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<StatusResponse>, ApiError> {
    let update = match member_from(&headers)? {
        Some(member) => match state.existing_session(&member).await {
            Some(session) => session.current_status(),
            None => state.viewer().current_status(),
        },
        None => state.viewer().current_status(),
    };
    Ok(Json(update.into()))
}

async fn list_investments(State(state): State<AppState>) -> Result<Json<RecordListResponse>, ApiError> {
    let records = state.viewer().load_all().await?;
    Ok(Json(RecordListResponse {
        records: records.iter().map(RecordView::from).collect(),
    }))
}

async fn get_investment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<RecordView>, ApiError> {
    let record = state.viewer().fetch_record(&RecordId::new(id)).await?;
    Ok(Json(RecordView::from(&record)))
}

async fn statistics(State(state): State<AppState>) -> Result<Json<ClubStatistics>, ApiError> {
    let viewer = state.viewer();
    let records = viewer.load_all().await?;
    Ok(Json(viewer.compute_statistics(&records)))
}

async fn create_investment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NewInvestment>,
) -> Result<(StatusCode, Json<CreateResponse>), ApiError> {
    let member = require_member(&headers)?;
    let session = state.session_for(&member).await?;

    let id = session.create_investment(req).await?;
    tracing::info!(record_id = %id, %member, "investment created");

    Ok((StatusCode::CREATED, Json(CreateResponse { id })))
}

async fn verify_investment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let member = require_member(&headers)?;
    let session = state.session_for(&member).await?;

    let id = RecordId::new(id);
    let clear_amount = session.verify_and_decrypt(&id).await?;

    Ok(Json(VerifyResponse { id, clear_amount }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    async fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let database_url = format!("sqlite:{}", dir.path().join("ledger.sqlite").to_string_lossy());
        let config = Config {
            addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            database_url: database_url.clone(),
            db_max_connections: 2,
            api_key: KEY.to_string(),
            contract_address: "0x00000000000000000000000000000000000c1ab0".to_string(),
            call_timeout: None,
            max_sessions: 16,
        };

        let db = db::connect(&database_url, 2).await.unwrap();
        db::init_schema(&db).await.unwrap();
        let state = AppState::new(config, db).await.unwrap();
        (dir, router(state))
    }

    fn post_json(uri: &str, member: Option<&str>, key: Option<&str>, body: Value) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(member) = member {
            builder = builder.header(MEMBER_HEADER, member);
        }
        if let Some(key) = key {
            builder = builder.header("X-API-KEY", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn proposal(amount: &str, risk_level: i64) -> Value {
        json!({ "name": "Index fund", "amount": amount, "risk_level": risk_level, "public_signal": 6 })
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_dir, app) = app().await;
        let response = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn writes_require_api_key() {
        let (_dir, app) = app().await;

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/investments", Some("0xalice"), None, proposal("10", 5)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post_json("/api/v1/investments", Some("0xalice"), Some("wrong"), proposal("10", 5)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_requires_member_and_valid_input() {
        let (_dir, app) = app().await;

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/investments", None, Some(KEY), proposal("10", 5)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/investments", Some("0xalice"), Some(KEY), proposal("10", 11)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());

        let response = app.oneshot(get_req("/api/v1/investments")).await.unwrap();
        assert_eq!(json_body(response).await["records"], json!([]));
    }

    #[tokio::test]
    async fn create_verify_and_aggregate() {
        let (_dir, app) = app().await;

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/investments", Some("0xalice"), Some(KEY), proposal("2500", 4)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = json_body(response).await["id"].as_str().unwrap().to_string();
        assert!(id.starts_with("investment-"));

        let response = app.clone().oneshot(get_req(&format!("/api/v1/investments/{id}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = json_body(response).await;
        assert_eq!(record["is_verified"], json!(false));
        assert!(record.get("clear_amount").is_none());

        let response = app
            .clone()
            .oneshot(post_json(&format!("/api/v1/investments/{id}/verify"), Some("0xbob"), Some(KEY), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["clear_amount"], json!(2500));

        let response = app.clone().oneshot(get_req("/api/v1/investments")).await.unwrap();
        let records = json_body(response).await;
        assert_eq!(records["records"][0]["clear_amount"], json!(2500));
        assert_eq!(records["records"][0]["creator"], json!("0xalice"));

        let response = app.oneshot(get_req("/api/v1/stats")).await.unwrap();
        let stats = json_body(response).await;
        assert_eq!(stats["total_proposals"], json!(1));
        assert_eq!(stats["verified_proposals"], json!(1));
        assert_eq!(stats["total_investment"], json!(2500));
        assert_eq!(stats["active_members"], json!(1));
        assert_eq!(stats["avg_public_signal"], json!(6.0));
    }

    #[tokio::test]
    async fn unknown_records_are_not_found() {
        let (_dir, app) = app().await;

        let response = app.clone().oneshot(get_req("/api/v1/investments/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json("/api/v1/investments/missing/verify", Some("0xalice"), Some(KEY), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn availability_is_announced_on_the_board() {
        let (_dir, app) = app().await;

        let response = app.clone().oneshot(get_req("/api/v1/status")).await.unwrap();
        let status = json_body(response).await;
        assert_eq!(status["status"], json!("idle"));
        assert_eq!(status["visible"], json!(false));

        let response = app.clone().oneshot(get_req("/api/v1/availability")).await.unwrap();
        assert_eq!(json_body(response).await["available"], json!(true));

        let response = app.oneshot(get_req("/api/v1/status")).await.unwrap();
        let status = json_body(response).await;
        assert_eq!(status["status"], json!("success"));
        assert_eq!(status["message"], json!("FHE System Available!"));
        assert_eq!(status["visible"], json!(true));
    }
}
