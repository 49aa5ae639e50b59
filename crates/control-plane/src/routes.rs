//! HTTP router for the ExecuStack Control Plane API.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the application router with all routes.
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health));

    let execution_routes = Router::new().route("/api/execute", post(handlers::execute));

    let realtime_routes = Router::new()
        .route(
            "/realtime/{tenant}/{namespace}/events",
            get(handlers::realtime::events),
        )
        .route(
            "/realtime/{tenant}/{namespace}/join",
            post(handlers::realtime::join),
        )
        .route(
            "/realtime/{tenant}/{namespace}/leave",
            post(handlers::realtime::leave),
        );

    Router::new()
        .merge(health_routes)
        .merge(execution_routes)
        .merge(realtime_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    use execustack_tasks::create_default_registry;

    use crate::bootstrap::build_stack;
    use crate::clients::ensure_admin_client;
    use crate::config::AppConfig;
    use crate::engine::Orchestrator;
    use crate::realtime::RealtimeHub;

    const API_KEY: &str = "test-key";

    async fn test_state() -> AppState {
        let config = AppConfig {
            in_memory: true,
            admin_api_key: API_KEY.to_string(),
            token_secret: Some("test-secret".to_string()),
            ..Default::default()
        };
        let hub = Arc::new(RealtimeHub::new());
        let stack = build_stack(&config, None, None, hub.clone()).await;
        let orchestrator = Orchestrator::new(Arc::new(create_default_registry()), stack);
        ensure_admin_client(&orchestrator, &config.admin_client_id, API_KEY)
            .await
            .unwrap();
        AppState::new(config, orchestrator, hub)
    }

    fn execute_request(key: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/execute")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_execute_requires_known_key() {
        let state = test_state().await;
        let definition = json!({ "tasks_definitions": {} });

        let missing = build_router(state.clone())
            .oneshot(execute_request(None, definition.clone()))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = build_router(state)
            .oneshot(execute_request(Some("nope"), definition))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_body() {
        let app = build_router(test_state().await);
        let request = Request::builder()
            .method("POST")
            .uri("/api/execute")
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_execute_runs_as_client_tenant() {
        let state = test_state().await;
        let response = build_router(state.clone())
            .oneshot(execute_request(
                Some(API_KEY),
                json!({
                    "tasks_definitions": {
                        "create": {
                            "function": "db_create_doc",
                            "params": { "collection_name": "notes", "payload": { "text": "hi" } }
                        }
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ctx = json_body(response).await;
        assert_eq!(ctx["execution_metrics"]["is_success"], json!(true));
        let id = ctx["tasks_results"]["create"]["document"]["id"].clone();

        let stored = state
            .stack()
            .store
            .find_one(&state.config.admin_client_id, "notes", &json!({ "id": id }))
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_is_unprocessable() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(execute_request(
                Some(API_KEY),
                json!({
                    "tasks_definitions": {
                        "update": {
                            "function": "db_update_doc",
                            "params": { "id": "notes~missing", "payload": { "text": "x" } }
                        }
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let ctx = json_body(response).await;
        assert_eq!(ctx["execution_metrics"]["is_success"], json!(false));
    }

    #[tokio::test]
    async fn test_realtime_connect_with_prepared_namespace() {
        let state = test_state().await;
        let response = build_router(state.clone())
            .oneshot(execute_request(
                Some(API_KEY),
                json!({
                    "tasks_definitions": {
                        "prep": {
                            "function": "ws_prep_namespace",
                            "params": { "namespace": "Live", "rooms": ["lobby"] }
                        }
                    }
                }),
            ))
            .await
            .unwrap();
        let ctx = json_body(response).await;
        let token = ctx["tasks_results"]["prep"]["token"].as_str().unwrap().to_string();

        let events = build_router(state.clone())
            .oneshot(
                Request::get(format!("/realtime/admin/live/events?token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(events.status(), StatusCode::OK);
        assert_eq!(
            events.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(state.hub.connection_count("/admin/live").await, 1);

        let forbidden = build_router(state)
            .oneshot(
                Request::get(format!("/realtime/admin/other/events?token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_realtime_rejects_bad_token() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                Request::get("/realtime/admin/live/events?token=garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_join_unknown_connection() {
        let app = build_router(test_state().await);
        let request = Request::builder()
            .method("POST")
            .uri("/realtime/admin/live/join")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "connection_id": "nope", "rooms": ["lobby"] }).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
