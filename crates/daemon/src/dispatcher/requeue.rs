// Failure path: send a failed event back for redelivery.
//
// The original body is POSTed to an external endpoint that re-injects it
// into the event stream later. Each hop increments a resend counter; past
// `max_resend` the event is dead-lettered (logged and dropped).

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use repomirror_common::event::{
    InboundEvent, EVENT_TYPE_SYSTEM, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_RESEND_COUNT,
    HEADER_TOKEN, HEADER_USER_AGENT,
};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const FORWARD_USER_AGENT: &str = "repomirror-daemon";
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded { resend_count: u32 },
    /// Resend budget spent; the event was not sent anywhere.
    DeadLettered { resend_count: u32 },
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("forward request failed: {0}")]
    Request(String),

    #[error("forward endpoint answered {status}")]
    Rejected { status: u16 },
}

impl From<reqwest::Error> for ForwardError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error.without_url().to_string())
    }
}

pub trait FailureSink: Send + Sync + 'static {
    fn forward(
        &self,
        event: &InboundEvent,
    ) -> impl Future<Output = Result<ForwardOutcome, ForwardError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpForwarder {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
    max_resend: u32,
}

impl HttpForwarder {
    pub fn new(endpoint: &str, token: &str, max_resend: u32) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid forward endpoint `{endpoint}`"))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!("forward endpoint must be http(s), got `{}`", endpoint.scheme());
        }
        let http = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .context("failed to build forward http client")?;
        Ok(Self { http, endpoint, token: token.to_string(), max_resend })
    }
}

impl FailureSink for HttpForwarder {
    async fn forward(&self, event: &InboundEvent) -> Result<ForwardOutcome, ForwardError> {
        let previous = event.resend_count();
        let resend_count = previous.saturating_add(1);
        if resend_count > self.max_resend {
            return Ok(ForwardOutcome::DeadLettered { resend_count: previous });
        }

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_USER_AGENT, FORWARD_USER_AGENT)
            .header(HEADER_EVENT_TYPE, EVENT_TYPE_SYSTEM)
            .header(HEADER_TOKEN, &self.token)
            .header(HEADER_EVENT_ID, Uuid::new_v4().to_string())
            .header(HEADER_RESEND_COUNT, resend_count.to_string())
            .body(event.body().to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Rejected { status: status.as_u16() });
        }
        Ok(ForwardOutcome::Forwarded { resend_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, routing::post, Router};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Seen = Arc<Mutex<Vec<(HeaderMap, Bytes)>>>;

    async fn record(State(seen): State<Seen>, headers: HeaderMap, body: Bytes) -> StatusCode {
        seen.lock().expect("seen lock").push((headers, body));
        StatusCode::OK
    }

    async fn spawn_endpoint(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = if status == StatusCode::OK {
            Router::new().route("/resend", post(record)).with_state(seen.clone())
        } else {
            Router::new().route("/resend", post(move || async move { status }))
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test endpoint should serve");
        });
        (format!("http://{addr}/resend"), seen)
    }

    fn event(resend_count: Option<&str>) -> InboundEvent {
        let mut headers = vec![
            (HEADER_USER_AGENT, "GitLab/16.0"),
            (HEADER_EVENT_TYPE, "Push Hook"),
            (HEADER_EVENT_ID, "0b1c0d2e-0000-4000-8000-000000000001"),
        ];
        if let Some(count) = resend_count {
            headers.push((HEADER_RESEND_COUNT, count));
        }
        InboundEvent::new(headers, br#"{"object_kind":"push","project_id":42}"#.to_vec())
    }

    #[tokio::test]
    async fn forwards_body_with_incremented_counter() {
        let (endpoint, seen) = spawn_endpoint(StatusCode::OK).await;
        let forwarder = HttpForwarder::new(&endpoint, "hmac", 5).expect("forwarder");

        let outcome = forwarder.forward(&event(Some("2"))).await.expect("forward");

        assert_eq!(outcome, ForwardOutcome::Forwarded { resend_count: 3 });
        let seen = seen.lock().expect("seen lock");
        let (headers, body) = &seen[0];
        assert_eq!(body.as_ref(), br#"{"object_kind":"push","project_id":42}"#);
        assert_eq!(headers["x-gitlab-event"], "System Hook");
        assert_eq!(headers["x-gitlab-token"], "hmac");
        assert_eq!(headers["user-agent"], FORWARD_USER_AGENT);
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["x-repomirror-resend-count"], "3");
        let id = headers["x-gitlab-event-uuid"].to_str().expect("ascii id");
        assert_ne!(id, "0b1c0d2e-0000-4000-8000-000000000001");
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn dead_letters_past_the_resend_budget() {
        let (endpoint, seen) = spawn_endpoint(StatusCode::OK).await;
        let forwarder = HttpForwarder::new(&endpoint, "hmac", 2).expect("forwarder");

        assert_eq!(
            forwarder.forward(&event(Some("1"))).await.expect("forward"),
            ForwardOutcome::Forwarded { resend_count: 2 }
        );
        assert_eq!(
            forwarder.forward(&event(Some("2"))).await.expect("dead letter"),
            ForwardOutcome::DeadLettered { resend_count: 2 }
        );
        assert_eq!(seen.lock().expect("seen lock").len(), 1);
    }

    #[tokio::test]
    async fn endpoint_errors_are_reported() {
        let (endpoint, _) = spawn_endpoint(StatusCode::SERVICE_UNAVAILABLE).await;
        let forwarder = HttpForwarder::new(&endpoint, "hmac", 5).expect("forwarder");

        let error = forwarder.forward(&event(None)).await.expect_err("503");
        assert!(matches!(error, ForwardError::Rejected { status: 503 }));
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(HttpForwarder::new("mailto:ops@example.test", "t", 5).is_err());
        assert!(HttpForwarder::new("::", "t", 5).is_err());
    }
}
