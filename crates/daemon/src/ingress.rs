// HTTP webhook ingress.
//
// `POST /hooks` hands the request to the dispatcher as an `InboundEvent`
// and answers only after the dispatcher's verdict, so a full sync queue
// holds the response open. `GET /healthz` reports dispatcher liveness.

use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header::HeaderValue, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use repomirror_common::event::{InboundEvent, HEADER_TOKEN};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::DispatcherState;
use crate::source::{DeliveryAck, EventSender};

pub const MAX_HOOK_BODY_BYTES: usize = 8 * 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct IngressState {
    sender: EventSender,
    dispatcher: watch::Receiver<DispatcherState>,
    token: Option<String>,
}

impl IngressState {
    pub fn new(
        sender: EventSender,
        dispatcher: watch::Receiver<DispatcherState>,
        token: Option<String>,
    ) -> Self {
        Self { sender, dispatcher, token: token.filter(|token| !token.is_empty()) }
    }
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/hooks", post(receive_hook))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_HOOK_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
}

async fn receive_hook(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    if let Some(expected) = &state.token {
        let presented = headers.get(HEADER_TOKEN).and_then(|value| value.to_str().ok());
        if !token_matches(presented, expected) {
            warn!("hook rejected: bad or missing token");
            return (StatusCode::UNAUTHORIZED, "invalid token".into());
        }
    }

    let event = InboundEvent::new(
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?.to_string()))),
        body.to_vec(),
    );

    match state.sender.deliver(event).await {
        DeliveryAck::Queued => (StatusCode::ACCEPTED, "queued".into()),
        DeliveryAck::Ignored => (StatusCode::ACCEPTED, "ignored".into()),
        DeliveryAck::Rejected(reason) => (StatusCode::BAD_REQUEST, reason),
        DeliveryAck::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting down".into()),
    }
}

/// Compares SHA-256 digests so timing does not reveal a matching prefix.
fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|presented| {
        Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
    })
}

async fn healthz(State(state): State<IngressState>) -> (StatusCode, &'static str) {
    match *state.dispatcher.borrow() {
        DispatcherState::Running => (StatusCode::OK, "ok"),
        DispatcherState::Idle => (StatusCode::SERVICE_UNAVAILABLE, "starting"),
        DispatcherState::Draining | DispatcherState::Stopped => {
            (StatusCode::SERVICE_UNAVAILABLE, "stopping")
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
