// Task generation: validate one inbound event and turn it into a `SyncTask`.
//
// Every rejection here is permanent. A malformed or unauthorized event will
// not get better on redelivery, so callers drop it instead of retrying.
// Non-push events are not errors; they are simply irrelevant.

use serde::Deserialize;
use thiserror::Error;

use super::{
    InboundEvent, EVENT_TYPE_PUSH, EVENT_TYPE_SYSTEM, HEADER_EVENT_ID, HEADER_EVENT_TYPE,
    HEADER_USER_AGENT,
};
use crate::types::{Account, AccountError, SyncTask};

const PUSH_KIND: &str = "push";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("unexpected message: empty header")]
    EmptyHeaders,

    #[error("unexpected message: empty payload")]
    EmptyBody,

    #[error("unknown {HEADER_USER_AGENT} header")]
    UnknownAgent,

    #[error("missing {HEADER_EVENT_TYPE} header")]
    MissingEventType,

    #[error("missing {HEADER_EVENT_ID} header")]
    MissingEventId,

    #[error("malformed push payload: {0}")]
    MalformedPayload(String),

    #[error("project path `{0}` is not of the form namespace/name")]
    InvalidPath(String),

    #[error("invalid owner: {0}")]
    InvalidOwner(#[from] AccountError),
}

/// Result of task generation for an event that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Task(SyncTask),
    /// Well-formed but not a push; nothing to do.
    Ignored { event_type: String },
}

#[derive(Debug, Deserialize)]
struct HookKind {
    #[serde(default)]
    object_kind: Option<String>,
    #[serde(default)]
    event_name: Option<String>,
}

impl HookKind {
    fn is_push(&self) -> bool {
        self.object_kind.as_deref() == Some(PUSH_KIND)
            || self.event_name.as_deref() == Some(PUSH_KIND)
    }
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    project_id: u64,
    project: ProjectRef,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    path_with_namespace: String,
}

#[derive(Debug, Clone)]
pub struct TaskGenerator {
    user_agent: String,
}

impl TaskGenerator {
    /// `user_agent` is the agent identity every accepted event must carry.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self { user_agent: user_agent.into() }
    }

    pub fn generate(&self, event: &InboundEvent) -> Result<TaskOutcome, TaskError> {
        let event_type = self.check_metadata(event)?;

        if event_type == EVENT_TYPE_SYSTEM {
            // Re-injected events arrive as system hooks; the payload says what they wrap.
            let kind: HookKind = parse_json(event.body())?;
            if !kind.is_push() {
                return Ok(TaskOutcome::Ignored { event_type: event_type.to_string() });
            }
        } else if event_type != EVENT_TYPE_PUSH {
            return Ok(TaskOutcome::Ignored { event_type: event_type.to_string() });
        }

        let payload: PushPayload = parse_json(event.body())?;
        let path = payload.project.path_with_namespace;
        let (owner, repo_name) = match path.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => (owner, name),
            _ => return Err(TaskError::InvalidPath(path)),
        };

        Ok(TaskOutcome::Task(SyncTask {
            owner: Account::new(owner)?,
            repo_id: payload.project_id.to_string(),
            repo_name: repo_name.to_string(),
        }))
    }

    fn check_metadata<'a>(&self, event: &'a InboundEvent) -> Result<&'a str, TaskError> {
        if !event.has_headers() {
            return Err(TaskError::EmptyHeaders);
        }
        if event.body().is_empty() {
            return Err(TaskError::EmptyBody);
        }
        if event.header(HEADER_USER_AGENT) != Some(self.user_agent.as_str()) {
            return Err(TaskError::UnknownAgent);
        }

        let event_type = event
            .header(HEADER_EVENT_TYPE)
            .filter(|value| !value.is_empty())
            .ok_or(TaskError::MissingEventType)?;

        if event.header(HEADER_EVENT_ID).filter(|value| !value.is_empty()).is_none() {
            return Err(TaskError::MissingEventId);
        }

        Ok(event_type)
    }
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, TaskError> {
    serde_json::from_slice(body).map_err(|error| TaskError::MalformedPayload(error.to_string()))
}
