// Inbound webhook events as delivered by the event source.
//
// Header names follow the hosting platform's webhook conventions. Lookups are
// case-insensitive because both HTTP and broker transports may re-case keys.

pub mod task;

use std::collections::BTreeMap;

pub const HEADER_USER_AGENT: &str = "User-Agent";
pub const HEADER_EVENT_TYPE: &str = "X-Gitlab-Event";
pub const HEADER_EVENT_ID: &str = "X-Gitlab-Event-UUID";
pub const HEADER_TOKEN: &str = "X-Gitlab-Token";
pub const HEADER_RESEND_COUNT: &str = "X-Repomirror-Resend-Count";

pub const EVENT_TYPE_PUSH: &str = "Push Hook";
pub const EVENT_TYPE_SYSTEM: &str = "System Hook";

/// One delivery from the event source: transport metadata plus raw JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundEvent {
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl InboundEvent {
    pub fn new<I, K, V>(headers: I, body: impl Into<Vec<u8>>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(key, value)| (key.as_ref().to_ascii_lowercase(), value.into()))
            .collect();
        Self { headers, body: body.into() }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// How many times this event has already been sent back for redelivery.
    /// Missing or unparsable values count as a first delivery.
    pub fn resend_count(&self) -> u32 {
        self.header(HEADER_RESEND_COUNT).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }
}
