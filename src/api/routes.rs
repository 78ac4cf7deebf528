//! API route definitions
//!
//! - /health                          - liveness
//! - /api/v1/status                   - counters, active alerts, uptime
//! - /api/v1/config                   - effective configuration
//! - /api/v1/signals                  - active environmental signals
//! - /api/v1/incidents?limit=N        - incident history (newest first)
//! - /api/v1/incidents/open           - open incidents
//! - /api/v1/incidents/acknowledge    - close an open incident

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, ApiState};

pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::get_status))
        .route("/config", get(handlers::get_config))
        .route("/signals", get(handlers::get_signals))
        .route("/incidents", get(handlers::list_incidents))
        .route("/incidents/open", get(handlers::open_incidents))
        .route("/incidents/acknowledge", post(handlers::acknowledge_incident))
        .with_state(state)
}

pub fn health_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::get_health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidents::{InMemoryIncidentStore, IncidentStore};
    use crate::pipeline::{AppState, ControlCommand};
    use crate::types::{AlertKey, Incident};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio::sync::{mpsc, RwLock};
    use tower::ServiceExt;

    fn create_test_state() -> (ApiState, mpsc::Receiver<ControlCommand>, Arc<InMemoryIncidentStore>) {
        let store = Arc::new(InMemoryIncidentStore::new());
        let (control_tx, control_rx) = mpsc::channel(4);
        let state = ApiState {
            app_state: Arc::new(RwLock::new(AppState::default())),
            store: store.clone(),
            control_tx,
        };
        (state, control_rx, store)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn ack_request(key: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/incidents/acknowledge")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "key": key }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let (state, _rx, _store) = create_test_state();
        let response = health_routes(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let v = body_json(response).await;
        assert_eq!(v["data"]["status"], "ok");
        assert_eq!(v["data"]["pipeline"], "INITIALIZING");
    }

    #[tokio::test]
    async fn test_status_route() {
        let (state, _rx, _store) = create_test_state();
        let response = api_routes(state)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let v = body_json(response).await;
        assert_eq!(v["data"]["stats"]["messages_received"], 0);
        assert!(v["data"]["active_alerts"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incident_listing_respects_limit() {
        let (state, _rx, store) = create_test_state();
        for stream in ["a", "b", "c"] {
            store
                .open_if_absent(Incident::open(AlertKey::metric(stream, "lag"), chrono::Utc::now(), "x"))
                .unwrap();
        }
        let app = api_routes(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/incidents?limit=2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let v = body_json(response).await;
        assert_eq!(v["data"].as_array().unwrap().len(), 2);
        assert_eq!(v["data"][0]["key"], "c:lag");

        let response = app
            .oneshot(Request::builder().uri("/incidents/open").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let v = body_json(response).await;
        assert_eq!(v["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_acknowledge_forwards_to_processing_loop() {
        let (state, mut rx, _store) = create_test_state();
        let responder = tokio::spawn(async move {
            match rx.recv().await {
                Some(ControlCommand::Acknowledge { key, respond_to }) => {
                    assert_eq!(key.to_string(), "ingest-a:lag");
                    respond_to.send(true).unwrap();
                }
                None => panic!("no command received"),
            }
        });

        let response = api_routes(state).oneshot(ack_request("ingest-a:lag")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let v = body_json(response).await;
        assert_eq!(v["data"]["acknowledged"], true);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_acknowledge_rejects_malformed_key() {
        let (state, _rx, _store) = create_test_state();
        let response = api_routes(state).oneshot(ack_request("no-kind")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_acknowledge_without_processor_is_unavailable() {
        let (state, rx, _store) = create_test_state();
        drop(rx);
        let response = api_routes(state).oneshot(ack_request("ingest-a:lag")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
