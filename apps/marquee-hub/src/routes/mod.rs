mod analytics;
mod devices;
mod dispatch;
mod fleets;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::state::HubState;

pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/devices", get(dispatch::list_devices))
        .route(
            "/devices/:device_id/commands",
            post(dispatch::dispatch_command),
        )
        .route(
            "/devices/:device_id/commands/stream",
            post(dispatch::stream_command),
        )
        .route(
            "/devices/:device_id/commands/ack",
            post(devices::ack_command),
        )
        .route(
            "/devices/:device_id/content",
            post(dispatch::dispatch_content),
        )
        .route(
            "/devices/:device_id/content/stream",
            post(dispatch::stream_content),
        )
        .route("/devices/:device_id/content/ack", post(devices::ack_content))
        .route("/commands/broadcast", post(dispatch::broadcast_command))
        .route(
            "/commands/broadcast/stream",
            post(dispatch::stream_broadcast_command),
        )
        .route("/content/broadcast", post(dispatch::broadcast_content))
        .route(
            "/content/broadcast/stream",
            post(dispatch::stream_broadcast_content),
        )
        .route("/fleets", get(fleets::list_fleets).post(fleets::create_fleet))
        .route(
            "/fleets/:fleet_id",
            get(fleets::get_fleet).delete(fleets::delete_fleet),
        )
        .route(
            "/fleets/:fleet_id/members",
            put(fleets::replace_members).post(fleets::add_members),
        )
        .route(
            "/fleets/:fleet_id/members/:device_id",
            delete(fleets::remove_member),
        )
        .route(
            "/fleets/:fleet_id/commands",
            post(dispatch::dispatch_command_to_fleet),
        )
        .route(
            "/fleets/:fleet_id/commands/stream",
            post(dispatch::stream_command_to_fleet),
        )
        .route(
            "/fleets/:fleet_id/content",
            post(dispatch::dispatch_content_to_fleet),
        )
        .route(
            "/fleets/:fleet_id/content/stream",
            post(dispatch::stream_content_to_fleet),
        )
        .route("/analytics/batches", post(analytics::ingest_batch))
        .route("/analytics/devices", get(analytics::list_devices))
        .route(
            "/analytics/devices/:fingerprint/events",
            get(analytics::device_events),
        )
        .route(
            "/ws/devices/:device_id/commands",
            get(devices::subscribe_commands),
        )
        .route(
            "/ws/devices/:device_id/content",
            get(devices::subscribe_content),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (
                axum::http::StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(msg),
                }),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                axum::http::StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::Internal => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorBody {
                    error: "internal_error",
                    message: Some("internal server error".into()),
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn hub() -> (HubState, Router) {
        let state = HubState::new(Config::default());
        let app = build_router(state.clone());
        (state, app)
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (_, app) = hub();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dispatch_to_unknown_device_is_404() {
        let (_, app) = hub();
        let body = json!({
            "command": { "type": "request_reboot", "delay_seconds": 1 }
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/devices/ghost/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let payload = response_json(response).await;
        assert_eq!(payload["status"], "not_connected");
        assert_eq!(payload["success"], false);
    }

    #[tokio::test]
    async fn fire_and_forget_command_completes() {
        let (state, app) = hub();
        let mut session = state.commands.attach("d1", None);

        let body = json!({
            "command": { "type": "set_clock", "simulated_time": "2026-08-01T00:00:00Z" },
            "requires_ack": false
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/devices/d1/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = response_json(response).await;
        assert_eq!(payload["status"], "completed");

        let frame = session.frames.recv().await.expect("frame forwarded");
        assert!(!frame.requires_ack);
    }

    #[tokio::test]
    async fn command_dispatch_and_ack_over_http() {
        let (state, app) = hub();
        let mut session = state.commands.attach("d1", None);

        // Device side: read the frame off the session and ack it through
        // the unary endpoint.
        let device = app.clone();
        tokio::spawn(async move {
            let frame = session.frames.recv().await.expect("frame delivered");
            let ack = json!({
                "command_id": frame.command_id,
                "status": "completed",
                "message": "rebooted"
            });
            let response = device
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/devices/d1/commands/ack")
                        .header("content-type", "application/json")
                        .body(Body::from(ack.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        });

        let body = json!({
            "command": { "type": "request_reboot", "delay_seconds": 0 },
            "timeout_ms": 2000
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/devices/d1/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = response_json(response).await;
        assert_eq!(payload["status"], "completed");
        assert_eq!(payload["final_ack"]["message"], "rebooted");
    }

    #[tokio::test]
    async fn device_timeout_maps_to_gateway_timeout() {
        let (state, app) = hub();
        let _session = state.commands.attach("d2", None);

        let body = json!({
            "command": { "type": "request_reboot", "delay_seconds": 0 },
            "timeout_ms": 30
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/devices/d2/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let payload = response_json(response).await;
        assert_eq!(payload["timed_out"], true);
    }

    #[tokio::test]
    async fn fleet_crud_and_unknown_fleet_dispatch() {
        let (_, app) = hub();

        let create = json!({ "name": "lobby", "members": ["d1", "d2"] });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/fleets")
                    .header("content-type", "application/json")
                    .body(Body::from(create.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fleet = response_json(response).await;
        let fleet_id = fleet["fleet_id"].as_str().unwrap().to_string();
        assert_eq!(fleet["members"], json!(["d1", "d2"]));

        let dispatch = json!({
            "command": { "type": "rotate_screen", "orientation": "portrait" },
            "timeout_ms": 100
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/fleets/ghost/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(dispatch.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Members are offline, so the fan-out reports them unreachable
        // without failing the aggregate.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/fleets/{fleet_id}/commands"))
                    .header("content-type", "application/json")
                    .body(Body::from(dispatch.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = response_json(response).await;
        assert_eq!(report["target_devices"], 2);
        assert_eq!(report["successful"], 0);
        assert_eq!(report["failed"], 2);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/fleets/{fleet_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn analytics_ingest_roundtrip() {
        let (_, app) = hub();
        let batch = json!({
            "batch_id": BASE64.encode([1u8; 16]),
            "device_fingerprint": 7,
            "events": [{
                "event_id": BASE64.encode([2u8; 16]),
                "recorded_at_ms": 1_700_000_000_000i64,
                "payload": { "kind": "impression" }
            }],
            "sent_at_ms": 1_700_000_000_500i64
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/analytics/batches")
                    .header("content-type", "application/json")
                    .body(Body::from(batch.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack = response_json(response).await;
        assert_eq!(ack["accepted"], true);
        assert_eq!(ack["throttle_ms"], 0);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/analytics/devices")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summaries = response_json(response).await;
        assert_eq!(summaries[0]["device_fingerprint"], 7);
        assert_eq!(summaries[0]["events_accepted"], 1);
    }

    #[tokio::test]
    async fn device_listing_reflects_sessions() {
        let (state, app) = hub();
        let _session = state.content.attach("billboard-3", None);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/devices?kind=content")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listing = response_json(response).await;
        assert_eq!(listing["devices"][0]["device_id"], "billboard-3");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/devices?kind=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
