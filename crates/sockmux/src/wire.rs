//! Wire types shared by the multiplexer and transports.
//!
//! Everything on the socket is a JSON-encoded [`Frame`]. SUBSCRIBE and
//! UNSUBSCRIBE control frames flow client-to-server; data pushes and
//! UNAUTHORIZED flow server-to-client over the same connection.

use serde::{Deserialize, Serialize};

/// Frame kind, the wire-level `type` field.
///
/// Data pushes carry server-defined type strings, preserved verbatim in
/// [`FrameKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    /// Register interest in a destination
    Subscribe,
    /// Drop interest in a destination
    Unsubscribe,
    /// Session rejection, may arrive with any destination
    Unauthorized,
    /// Any other frame type
    #[serde(untagged)]
    Other(String),
}

/// A single message on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Topic the frame belongs to; empty when the server omits it
    #[serde(default)]
    pub destination: String,

    /// Frame kind
    #[serde(rename = "type")]
    pub kind: FrameKind,

    /// Payload: JSON or plain text inbound, the JSON-encoded filter outbound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Filter field-set the server attached to a data push
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Filter>,
}

impl Frame {
    /// Build an outbound control frame.
    pub fn control(destination: impl Into<String>, kind: FrameKind, message: Option<String>) -> Self {
        Self {
            destination: destination.into(),
            kind,
            message,
            to: None,
        }
    }
}

/// Field-set narrowing which inbound frames satisfy a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Agent the subscription is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Agent group the subscription is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Build version the subscription is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,
}

impl Filter {
    /// True when every field this filter declares is present and equal in
    /// the frame's `to` field-set.
    ///
    /// A frame without `to` only satisfies a filter that declares nothing.
    pub fn matches(&self, to: Option<&Filter>) -> bool {
        let Some(to) = to else {
            return *self == Filter::default();
        };

        fn field_matches(declared: &Option<String>, got: &Option<String>) -> bool {
            match declared {
                Some(want) => got.as_ref() == Some(want),
                None => true,
            }
        }

        field_matches(&self.agent_id, &to.agent_id)
            && field_matches(&self.group_id, &to.group_id)
            && field_matches(&self.build_version, &to.build_version)
    }
}

/// Normalize a topic for the wire: percent-encode reserved characters while
/// keeping path separators readable.
pub fn normalize_topic(topic: &str) -> String {
    urlencoding::encode(topic).replace("%2F", "/")
}

/// Deterministic identifier for a (normalized topic, filter) pair.
///
/// `Filter` is a plain struct with fixed field order, so structurally equal
/// filters always serialize identically and coalesce onto one key. A filter
/// with no declared fields still yields a key distinct from the bare topic.
pub fn wire_key(topic: &str, filter: Option<&Filter>) -> String {
    match filter {
        Some(filter) => {
            let json = serde_json::to_string(filter).unwrap_or_default();
            format!("{topic}{json}")
        }
        None => topic.to_owned(),
    }
}
