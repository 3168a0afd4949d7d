//! HTTP front-end for the function handler
//!
//! - `POST /invoke` takes a raw invocation event and answers with the
//!   `FunctionResponse` as JSON
//! - `GET /run?token=..&testFilesPaths=..` runs directly and answers with the
//!   response's status code and body
//! - `GET /health`

use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use suiterun_common::FunctionResponse;

use crate::handler::{FunctionHandler, InvocationError};

pub fn router(handler: Arc<FunctionHandler>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/invoke", post(invoke_handler))
        .route("/run", get(run_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

pub async fn serve(addr: SocketAddr, handler: Arc<FunctionHandler>) -> anyhow::Result<()> {
    info!("Function endpoint listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(handler))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Run the handler on its own task so a dropped request cancels the run
/// instead of abandoning it before teardown
async fn dispatch(
    handler: Arc<FunctionHandler>,
    event: serde_json::Value,
) -> Result<Result<FunctionResponse, InvocationError>, Response> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let task = tokio::spawn(async move { handler.handle_with_cancel(event, cancel).await });
    let joined = task.await;
    guard.disarm();

    joined.map_err(|e| {
        error!("Invocation task failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response()
    })
}

fn bad_request(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "suiterun-web",
        "version": suiterun_common::VERSION,
    }))
}

async fn invoke_handler(State(handler): State<Arc<FunctionHandler>>, body: Bytes) -> Response {
    let event: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => return bad_request(e),
    };

    match dispatch(handler, event).await {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(e)) => bad_request(e),
        Err(response) => response,
    }
}

async fn run_handler(
    State(handler): State<Arc<FunctionHandler>>,
    RawQuery(query): RawQuery,
) -> Response {
    let event = query_event(query.as_deref().unwrap_or_default());

    match dispatch(handler, event).await {
        Ok(Ok(response)) => {
            let status =
                StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                response.body,
            )
                .into_response()
        }
        Ok(Err(e)) => bad_request(e),
        Err(response) => response,
    }
}

/// Build an invocation event from a query string; `testFilesPaths` may repeat
fn query_event(query: &str) -> serde_json::Value {
    let mut token = None;
    let mut paths = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "token" => token = Some(value.into_owned()),
            "testFilesPaths" => paths.push(value.into_owned()),
            _ => {}
        }
    }

    serde_json::json!({
        "queryStringParameters": {
            "token": token,
            "testFilesPaths": paths,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::time::Duration;
    use suiterun_runner::testing::FakeRig;
    use suiterun_runner::{Orchestrator, ProvisionContext, TestFileResolver};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(rig: &FakeRig, dir: &TempDir) -> Router {
        let orchestrator = Orchestrator::new(
            TestFileResolver::new(dir.path(), dir.path(), rig.fetcher()),
            rig.server_factory(),
            rig.browser_launch(),
            Arc::new(ProvisionContext::new(rig.provisioner())),
        )
        .with_readiness_timeout(Some(Duration::from_secs(5)));
        router(Arc::new(FunctionHandler::new(
            orchestrator,
            Some("secret".to_string()),
        )))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_query_event_collects_repeated_paths() {
        let event = query_event("token=secret&testFilesPaths=a.js&testFilesPaths=https%3A%2F%2Fexample.com%2Fb.js");
        assert_eq!(
            event,
            json!({"queryStringParameters": {
                "token": "secret",
                "testFilesPaths": ["a.js", "https://example.com/b.js"],
            }})
        );
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&FakeRig::new(), &dir)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_run_with_bad_token() {
        let dir = tempfile::tempdir().unwrap();
        let rig = FakeRig::new();
        let response = app(&rig, &dir)
            .oneshot(
                Request::get("/run?token=nope&testFilesPaths=a.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, r#""Token is invalid""#);
        assert!(rig.log().is_empty());
    }

    #[tokio::test]
    async fn test_run_reports_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "").unwrap();
        let rig = FakeRig::new();

        let response = app(&rig, &dir)
            .oneshot(
                Request::get("/run?token=secret&testFilesPaths=a.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body, json!({"a.js": {"total": 1, "passed": 1}}));
    }

    #[tokio::test]
    async fn test_invoke_returns_function_response() {
        let dir = tempfile::tempdir().unwrap();
        let event = json!({"queryStringParameters": {"token": "bad"}});

        let response = app(&FakeRig::new(), &dir)
            .oneshot(
                Request::post("/invoke")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(event.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: FunctionResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body.status_code, 403);
    }

    #[tokio::test]
    async fn test_invoke_rejects_malformed_events() {
        let dir = tempfile::tempdir().unwrap();

        for payload in ["not json", "{}"] {
            let response = app(&FakeRig::new(), &dir)
                .oneshot(
                    Request::post("/invoke")
                        .body(Body::from(payload))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }
}
