//! Control API handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::server::ControlState;

/// `GET /status`: liveness probe with the current speaker count.
pub async fn get_status(State(state): State<ControlState>) -> Json<Value> {
    let speakers_count = state.app.lock().speakers.len();
    Json(json!({
        "status": "running",
        "speakers_count": speakers_count,
    }))
}

/// `POST /api/volume`: apply a volume to every live hostage.
pub async fn set_volume(
    State(state): State<ControlState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(volume) = body.get("volume").and_then(Value::as_f64) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing volume"})),
        );
    };

    let applied = state.manager.set_volume_all(volume as f32);
    tracing::info!("Volume {:.2} applied to {} hostages", volume, applied);
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

/// `POST /api/speak`: reserved for TTS injection.
pub async fn speak(State(_state): State<ControlState>) -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use crate::control::ControlServer;
    use crate::group::GroupManager;
    use crate::raop::client::mock::MockFactory;
    use crate::state::testutil::speaker;
    use crate::state::AppState;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn server() -> (AppState, ControlServer) {
        let state = AppState::new();
        let manager = Arc::new(GroupManager::new(
            state.clone(),
            Arc::new(MockFactory::new()),
        ));
        (state.clone(), ControlServer::new(state, manager))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_speaker_count() {
        let (state, server) = server();
        state.apply_snapshot(vec![
            speaker("A", [10, 0, 0, 2], 7000, "0"),
            speaker("B", [10, 0, 0, 3], 7000, "0"),
        ]);

        let response = server
            .router()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["speakers_count"], 2);
    }

    #[tokio::test]
    async fn test_volume_requires_field() {
        let (_state, server) = server();

        let response = server
            .router()
            .oneshot(
                Request::post("/api/volume")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "missing volume");
    }

    #[tokio::test]
    async fn test_volume_ok() {
        let (_state, server) = server();

        let response = server
            .router()
            .oneshot(
                Request::post("/api/volume")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"volume": 0.5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_speak_is_reserved() {
        let (_state, server) = server();

        let response = server
            .router()
            .oneshot(Request::post("/api/speak").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
