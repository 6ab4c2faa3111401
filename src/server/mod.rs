//! Reference backend for the document API.
//!
//! Stores rows in memory, partitioned by the caller's `x-client-id`, and
//! assigns a fresh `_id` to every created row. Everything the client sends,
//! including the `_cid` correlation id, is echoed back.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check (no client id required)
//! - `GET /api/{resource}`: List rows
//! - `POST /api/{resource}`: Create a row
//! - `PUT /api/{resource}/{id}`: Replace a row
//! - `DELETE /api/{resource}/{id}`: Delete a row

mod collections;

pub use collections::{ApiError, CollectionStore};

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::gateway::CLIENT_ID_HEADER;

/// Caller identity, added to request extensions by [`client_id_middleware`].
#[derive(Debug, Clone)]
pub struct ClientId(pub String);

/// Rejects requests without a usable `x-client-id` header.
async fn client_id_middleware(mut request: Request, next: Next) -> Response {
    let client_id = request
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    match client_id {
        Some(id) => {
            request.extensions_mut().insert(ClientId(id));
            next.run(request).await
        }
        None => ApiError::response(
            StatusCode::BAD_REQUEST,
            "missing_client_id",
            "x-client-id header required",
        ),
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Builds the full application router.
pub fn router(store: CollectionStore) -> Router {
    let api_routes = Router::new()
        .route(
            "/{resource}",
            get(collections::list_documents).post(collections::create_document),
        )
        .route(
            "/{resource}/{id}",
            axum::routing::put(collections::update_document)
                .delete(collections::delete_document),
        )
        .layer(middleware::from_fn(client_id_middleware))
        .with_state(store);

    Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, client: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CLIENT_ID_HEADER, client)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_client_id() {
        let app = router(CollectionStore::new());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_client_id_is_rejected() {
        let app = router(CollectionStore::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sitebuilder_projects")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "missing_client_id");
    }

    #[tokio::test]
    async fn test_create_echoes_body_with_id() {
        let app = router(CollectionStore::new());
        let response = app
            .oneshot(post(
                "/api/sitebuilder_projects",
                "c1",
                json!({"name": "Demo", "_cid": "abc"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert!(body["_id"].is_string());
        assert_eq!(body["name"], "Demo");
        assert_eq!(body["_cid"], "abc");
    }

    #[tokio::test]
    async fn test_non_object_body_is_rejected() {
        let app = router(CollectionStore::new());
        let response = app
            .oneshot(post("/api/sitebuilder_projects", "c1", json!([1, 2])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let app = router(CollectionStore::new());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/sitebuilder_projects/nope")
                    .header(CLIENT_ID_HEADER, "c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
