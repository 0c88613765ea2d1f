//! Twitch EventSub webhook ingress.
//!
//! `POST /eventsub` verifies the HMAC signature Twitch attaches to every delivery and
//! turns `stream.online`/`stream.offline` notifications into [`ClipEvent`]s.
//! `GET /healthcheck` reports liveness.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::ClipEvent;

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_ID_HEADER: &str = "twitch-eventsub-message-id";
const MESSAGE_TIMESTAMP_HEADER: &str = "twitch-eventsub-message-timestamp";
const MESSAGE_SIGNATURE_HEADER: &str = "twitch-eventsub-message-signature";
const MESSAGE_TYPE_HEADER: &str = "twitch-eventsub-message-type";

const MESSAGE_TYPE_VERIFICATION: &str = "webhook_callback_verification";
const MESSAGE_TYPE_NOTIFICATION: &str = "notification";
const MESSAGE_TYPE_REVOCATION: &str = "revocation";

const HMAC_PREFIX: &str = "sha256=";

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(default)]
    challenge: Option<String>,
    subscription: Subscription,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    condition: serde_json::Value,
}

#[derive(Clone)]
struct WebhookState {
    secret: Arc<str>,
    events: mpsc::Sender<ClipEvent>,
}

pub fn router(secret: &str, events: mpsc::Sender<ClipEvent>) -> Router {
    let state = WebhookState {
        secret: Arc::from(secret),
        events,
    };

    Router::new()
        .route("/eventsub", post(handle_eventsub))
        .route("/healthcheck", get(healthcheck))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `addr` until `token` is cancelled.
pub async fn serve(addr: SocketAddr, router: Router, token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("failed to bind webhook listener on {addr}: {e}")))?;
    info!(%addr, "EventSub webhook listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;
    Ok(())
}

async fn healthcheck() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "available" }))
}

async fn handle_eventsub(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !verify_signature(
        &state.secret,
        header_value(&headers, MESSAGE_ID_HEADER),
        header_value(&headers, MESSAGE_TIMESTAMP_HEADER),
        &body,
        header_value(&headers, MESSAGE_SIGNATURE_HEADER),
    ) {
        warn!(
            message_id = header_value(&headers, MESSAGE_ID_HEADER),
            "EventSub signature verification failed"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let notification: Notification = match serde_json::from_slice(&body) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Malformed EventSub payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match header_value(&headers, MESSAGE_TYPE_HEADER) {
        MESSAGE_TYPE_VERIFICATION => {
            info!(subscription = %notification.subscription.kind, "EventSub callback verification");
            let challenge = notification.challenge.unwrap_or_default();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response()
        }
        MESSAGE_TYPE_NOTIFICATION => {
            let event = match notification.subscription.kind.as_str() {
                "stream.online" => Some(ClipEvent::StreamOnline),
                "stream.offline" => Some(ClipEvent::StreamOffline),
                other => {
                    debug!(subscription = %other, "Ignoring EventSub notification");
                    None
                }
            };

            if let Some(event) = event {
                info!(?event, "EventSub stream lifecycle notification");
                if state.events.send(event).await.is_err() {
                    warn!("Orchestrator stopped, dropping lifecycle event");
                    return StatusCode::SERVICE_UNAVAILABLE.into_response();
                }
            }
            StatusCode::NO_CONTENT.into_response()
        }
        MESSAGE_TYPE_REVOCATION => {
            warn!(
                subscription = %notification.subscription.kind,
                reason = notification.subscription.status.as_deref().unwrap_or("unknown"),
                condition = %notification.subscription.condition,
                "EventSub subscription revoked"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        other => {
            debug!(message_type = %other, "Unknown EventSub message type");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Check `sha256=<hex>` against HMAC-SHA256(secret, id + timestamp + body) in constant time.
fn verify_signature(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
) -> bool {
    let Some(hex_sig) = signature.strip_prefix(HMAC_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "s3cr3t-s3cr3t";

    fn sign(id: &str, ts: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(id.as_bytes());
        mac.update(ts.as_bytes());
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn request(message_type: &str, body: &str, signature: Option<String>) -> Request<Body> {
        let id = "msg-1";
        let ts = "2026-01-01T00:00:00Z";
        Request::post("/eventsub")
            .header(MESSAGE_ID_HEADER, id)
            .header(MESSAGE_TIMESTAMP_HEADER, ts)
            .header(MESSAGE_TYPE_HEADER, message_type)
            .header(
                MESSAGE_SIGNATURE_HEADER,
                signature.unwrap_or_else(|| sign(id, ts, body)),
            )
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn notification(kind: &str) -> String {
        serde_json::json!({
            "subscription": { "type": kind, "status": "enabled", "condition": { "broadcaster_user_id": "1" } },
            "event": { "broadcaster_user_login": "channel" }
        })
        .to_string()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn answers_callback_verification_with_challenge() {
        let (tx, _rx) = mpsc::channel(4);
        let body = serde_json::json!({
            "challenge": "pogchamp-kappa-360noscope-vohiyo",
            "subscription": { "type": "stream.online", "status": "webhook_callback_verification_pending" }
        })
        .to_string();

        let response = router(SECRET, tx)
            .oneshot(request(MESSAGE_TYPE_VERIFICATION, &body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "pogchamp-kappa-360noscope-vohiyo");
    }

    #[tokio::test]
    async fn forwards_stream_lifecycle_notifications() {
        let (tx, mut rx) = mpsc::channel(4);
        let app = router(SECRET, tx);

        let online = app
            .clone()
            .oneshot(request(MESSAGE_TYPE_NOTIFICATION, &notification("stream.online"), None))
            .await
            .unwrap();
        assert_eq!(online.status(), StatusCode::NO_CONTENT);
        assert_eq!(rx.recv().await, Some(ClipEvent::StreamOnline));

        let offline = app
            .oneshot(request(MESSAGE_TYPE_NOTIFICATION, &notification("stream.offline"), None))
            .await
            .unwrap();
        assert_eq!(offline.status(), StatusCode::NO_CONTENT);
        assert_eq!(rx.recv().await, Some(ClipEvent::StreamOffline));
    }

    #[tokio::test]
    async fn rejects_bad_signature_without_forwarding() {
        let (tx, mut rx) = mpsc::channel(4);
        let forged = format!("sha256={}", "0".repeat(64));

        let response = router(SECRET, tx)
            .oneshot(request(
                MESSAGE_TYPE_NOTIFICATION,
                &notification("stream.online"),
                Some(forged),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn revocation_is_acknowledged() {
        let (tx, mut rx) = mpsc::channel(4);
        let response = router(SECRET, tx)
            .oneshot(request(MESSAGE_TYPE_REVOCATION, &notification("stream.online"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn healthcheck_reports_available() {
        let (tx, _rx) = mpsc::channel(1);
        let response = router(SECRET, tx)
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"status":"available"}"#);
    }

    #[test]
    fn signature_requires_prefix_and_matching_inputs() {
        let good = sign("id", "ts", "body");
        assert!(verify_signature(SECRET, "id", "ts", b"body", &good));
        assert!(!verify_signature(SECRET, "id", "ts", b"other", &good));
        assert!(!verify_signature(SECRET, "id", "ts", b"body", good.trim_start_matches("sha256=")));
        assert!(!verify_signature(SECRET, "id", "ts", b"body", ""));
    }
}
