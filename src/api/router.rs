//! API router.
//!
//! Returns a composable `Router`; REST endpoints nest under `/api/`, the
//! push channel lives at `/ws/jobs/:id`.
//!
//! NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;
use crate::api::websocket;
use crate::core_state::CoreState;

pub fn api_router(core: Arc<CoreState>) -> Router {
    let ctx = ApiContext::new(core);

    let rest = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/submissions", post(endpoints::submissions::submit))
        .route("/submissions/check", post(endpoints::submissions::check))
        .route("/jobs/:id/status", get(endpoints::jobs::status))
        .route("/jobs/:id/cancel", post(endpoints::jobs::cancel))
        .with_state(ctx.clone());

    let ws = Router::new()
        .route("/ws/jobs/:id", get(websocket::ws_upgrade))
        .with_state(ctx);

    Router::new()
        .nest("/api", rest)
        .merge(ws)
        .layer(TraceLayer::new_for_http())
        // Local UI clients connect from their own origin
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::models::JobStage;
    use crate::pipeline::collaborators::mock;

    fn test_core() -> Arc<CoreState> {
        Arc::new(CoreState::in_memory(mock::all_ok()).unwrap())
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn response_json(response: axum::http::Response<Body>) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 65536).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn submit_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "raw_text": text,
            "original_name": "note.txt",
            "billed_codes": ["99213"],
        })
    }

    #[tokio::test]
    async fn health_response_shape() {
        let app = api_router(test_core());
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(!json["version"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_accepts_and_returns_job_id() {
        let app = api_router(test_core());
        let response = app
            .oneshot(json_request("POST", "/api/submissions", submit_body("a note")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = response_json(response).await;
        assert_eq!(json["status"], "accepted");
        assert!(Uuid::parse_str(json["job_id"].as_str().unwrap()).is_ok());
        assert!(Uuid::parse_str(json["subject_id"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn submit_rejects_empty_text() {
        let app = api_router(test_core());
        let response = app
            .oneshot(json_request("POST", "/api/submissions", submit_body("  ")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn duplicate_without_decision_returns_409_with_prior() {
        let core = test_core();
        let app = api_router(core.clone());
        let first = app
            .oneshot(json_request("POST", "/api/submissions", submit_body("same note")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let first_json = response_json(first).await;

        let app = api_router(core);
        let second = app
            .oneshot(json_request("POST", "/api/submissions", submit_body("same note")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let json = response_json(second).await;
        assert_eq!(json["error"]["code"], "DUPLICATE_DECISION_REQUIRED");
        assert_eq!(json["error"]["prior"]["subject_id"], first_json["subject_id"]);
    }

    #[tokio::test]
    async fn duplicate_skip_returns_200_skipped() {
        let core = test_core();
        let app = api_router(core.clone());
        app.oneshot(json_request("POST", "/api/submissions", submit_body("same note")))
            .await
            .unwrap();

        let mut body = submit_body("same note");
        body["duplicate_action"] = "skip".into();
        let app = api_router(core);
        let response = app
            .oneshot(json_request("POST", "/api/submissions", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "skipped");
        assert!(json["prior"]["subject_id"].is_string());
    }

    #[tokio::test]
    async fn check_reports_duplicates() {
        let core = test_core();
        let app = api_router(core.clone());
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/submissions/check",
                serde_json::json!({"raw_text": "unseen"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["is_duplicate"], false);

        let app = api_router(core.clone());
        app.oneshot(json_request("POST", "/api/submissions", submit_body("seen")))
            .await
            .unwrap();

        let app = api_router(core);
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/submissions/check",
                serde_json::json!({"raw_text": "seen"}),
            ))
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json["is_duplicate"], true);
        assert!(json["prior"]["subject_id"].is_string());
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_404() {
        let app = api_router(test_core());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{}/status", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn status_serves_snapshot_shape() {
        let core = test_core();
        let app = api_router(core.clone());
        let submitted = app
            .oneshot(json_request("POST", "/api/submissions", submit_body("a note")))
            .await
            .unwrap();
        let job_id = response_json(submitted).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        let app = api_router(core);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{job_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["job_id"], job_id);
        assert!(json["stage"].is_string());
        assert!(json["progress_percent"].is_number());
        assert!(json["current_step_label"].is_string());
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_404() {
        let app = api_router(test_core());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/jobs/{}/cancel", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_reports_failed_state() {
        let core = test_core();

        // Admit without spawning the driver, so the job sits idle
        let job = match crate::pipeline::intake::admit(
            &core,
            crate::pipeline::intake::SubmissionRequest {
                raw_text: "cancel me".into(),
                original_name: "note.txt".into(),
                billed_codes: vec![],
                duplicate_action: None,
            },
        )
        .unwrap()
        {
            crate::pipeline::intake::IntakeOutcome::Accepted { job, .. } => job,
            other => panic!("expected Accepted, got {other:?}"),
        };

        let app = api_router(core);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/jobs/{}/cancel", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["stage"], JobStage::Failed.as_str());
        assert_eq!(json["error_kind"], "cancelled");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = api_router(test_core());
        let response = app
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
