//! ---
//! courier_section: "02-envelope-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Endpoint addressing and envelope data model."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_with::{serde_as, DurationMilliSeconds};
use uuid::Uuid;

use crate::endpoint::{Endpoint, Recipients};
use crate::{EnvelopeError, Result};

/// Schema version stamped on every envelope.
pub const SCHEMA_VERSION: u16 = 1;

/// Unique envelope identifier, also used as the correlation key for replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Access the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error raised by a remote message processor and carried back as reply content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteFault {
    /// Machine readable classification chosen by the remote processor.
    pub code: String,
    /// Human readable description.
    pub message: String,
}

impl RemoteFault {
    /// Construct a fault with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Content carried by an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Content {
    /// Opaque application payload.
    Payload(JsonValue),
    /// Another envelope forwarded as content.
    Nested(Box<Envelope>),
    /// Processing error reported by the remote side.
    Fault(RemoteFault),
}

impl Content {
    /// Serialise any value into a payload.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Content::Payload)
            .map_err(|err| EnvelopeError::Codec(err.to_string()))
    }

    /// A null payload carries nothing and is rejected at envelope construction.
    pub fn is_empty(&self) -> bool {
        matches!(self, Content::Payload(JsonValue::Null))
    }

    /// Short label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Content::Payload(_) => "payload",
            Content::Nested(_) => "nested",
            Content::Fault(_) => "fault",
        }
    }
}

impl From<JsonValue> for Content {
    fn from(value: JsonValue) -> Self {
        Content::Payload(value)
    }
}

impl From<RemoteFault> for Content {
    fn from(value: RemoteFault) -> Self {
        Content::Fault(value)
    }
}

impl From<Envelope> for Content {
    fn from(value: Envelope) -> Self {
        Content::Nested(Box::new(value))
    }
}

/// Optional settings applied when constructing an envelope.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    recipients: Recipients,
    timeout: Option<Duration>,
    one_way: bool,
    reply_to: Option<MessageId>,
}

impl EnvelopeOptions {
    /// Start from defaults: broadcast, no timeout, reply expected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recipient.
    pub fn to(mut self, recipient: Endpoint) -> Self {
        self.recipients.insert(recipient);
        self
    }

    /// Add several recipients, keeping first-seen order.
    pub fn to_all(mut self, recipients: impl IntoIterator<Item = Endpoint>) -> Self {
        self.recipients.extend(recipients);
        self
    }

    /// Deadline for awaiting a reply.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Optional variant of [`EnvelopeOptions::timeout`].
    pub fn timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the envelope as fire-and-forget.
    pub fn one_way(mut self, one_way: bool) -> Self {
        self.one_way = one_way;
        self
    }

    /// Mark the envelope as a reply to `request_id`.
    pub fn reply_to(mut self, request_id: MessageId) -> Self {
        self.reply_to = Some(request_id);
        self
    }
}

/// Transport unit wrapping content with routing and correlation metadata.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, never reused.
    pub id: MessageId,
    /// Version of the envelope schema.
    pub schema_version: u16,
    /// Carried content.
    pub content: Content,
    /// Identity of the originating process.
    pub sender: Endpoint,
    /// Destinations; empty means broadcast.
    #[serde(default)]
    pub recipients: Recipients,
    /// Id of the request this envelope answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// True when no reply is expected.
    #[serde(default)]
    pub is_one_way: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Caller-supplied reply deadline.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Envelope {
    /// Build a new envelope with a fresh id.
    pub fn new(
        content: impl Into<Content>,
        sender: Endpoint,
        options: EnvelopeOptions,
    ) -> Result<Self> {
        let envelope = Self {
            id: MessageId::new(),
            schema_version: SCHEMA_VERSION,
            content: content.into(),
            sender,
            recipients: options.recipients,
            reply_to_id: options.reply_to,
            is_one_way: options.one_way,
            created_at: Utc::now(),
            timeout: options.timeout,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Build the reply to `request`, addressed back to its sender.
    ///
    /// Replies are one-way: nobody awaits a reply to a reply.
    pub fn reply(request: &Envelope, sender: Endpoint, content: impl Into<Content>) -> Result<Self> {
        let options = EnvelopeOptions::new()
            .to(request.sender.clone())
            .one_way(true)
            .reply_to(request.id);
        Envelope::new(content, sender, options)
    }

    /// Check structural invariants. Routers call this on decoded envelopes.
    pub fn validate(&self) -> Result<()> {
        if self.content.is_empty() {
            return Err(EnvelopeError::EmptyContent);
        }
        if !self.sender.is_addressable() || self.recipients.iter().any(|r| !r.is_addressable()) {
            return Err(EnvelopeError::InvalidEndpoint);
        }
        if self.reply_to_id == Some(self.id) {
            return Err(EnvelopeError::SelfReply(self.id));
        }
        Ok(())
    }

    /// True when this envelope answers an earlier request.
    pub fn is_reply(&self) -> bool {
        self.reply_to_id.is_some()
    }

    /// Convenience label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        if self.is_reply() {
            "reply"
        } else if self.is_one_way {
            "one_way"
        } else {
            "request"
        }
    }

    /// Unwrap nested envelopes down to the application content.
    pub fn innermost_content(&self) -> &Content {
        let mut content = &self.content;
        while let Content::Nested(inner) = content {
            content = &inner.content;
        }
        content
    }

    /// Decode the innermost payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self.innermost_content() {
            Content::Payload(value) => serde_json::from_value(value.clone())
                .map_err(|err| EnvelopeError::Codec(err.to_string())),
            Content::Fault(fault) => Err(EnvelopeError::Codec(format!(
                "envelope carries a fault instead of a payload: {fault}"
            ))),
            Content::Nested(_) => Err(EnvelopeError::Codec("unexpected nested envelope".into())),
        }
    }

    /// Copy of this envelope addressed to a subset of its recipients.
    pub fn narrowed_to(&self, recipients: Recipients) -> Envelope {
        Envelope {
            recipients,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> Endpoint {
        Endpoint::instance("billing", "node-1")
    }

    #[test]
    fn new_envelope_gets_fresh_identity() {
        let a = Envelope::new(json!({"op": "ping"}), sender(), EnvelopeOptions::new()).unwrap();
        let b = Envelope::new(json!({"op": "ping"}), sender(), EnvelopeOptions::new()).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.schema_version, SCHEMA_VERSION);
        assert!(a.recipients.is_empty());
        assert_eq!(a.kind(), "request");
    }

    #[test]
    fn null_content_is_rejected() {
        let err = Envelope::new(JsonValue::Null, sender(), EnvelopeOptions::new()).unwrap_err();
        assert_eq!(err, EnvelopeError::EmptyContent);
    }

    #[test]
    fn reply_targets_request_sender() {
        let request = Envelope::new(
            json!("ping"),
            sender(),
            EnvelopeOptions::new().to(Endpoint::app("ledger")),
        )
        .unwrap();
        let reply =
            Envelope::reply(&request, Endpoint::instance("ledger", "n9"), json!("pong")).unwrap();
        assert_eq!(reply.reply_to_id, Some(request.id));
        assert!(reply.is_one_way);
        assert_eq!(reply.recipients.len(), 1);
        assert!(reply.recipients.contains(&sender()));
        assert_eq!(reply.kind(), "reply");
    }

    #[test]
    fn self_reply_fails_validation() {
        let mut envelope = Envelope::new(json!(1), sender(), EnvelopeOptions::new()).unwrap();
        envelope.reply_to_id = Some(envelope.id);
        assert_eq!(
            envelope.validate(),
            Err(EnvelopeError::SelfReply(envelope.id))
        );
    }

    #[test]
    fn nested_content_unwraps_to_innermost_payload() {
        let inner = Envelope::new(json!({"value": 7}), sender(), EnvelopeOptions::new()).unwrap();
        let middle = Envelope::new(inner, sender(), EnvelopeOptions::new()).unwrap();
        let outer = Envelope::new(middle, sender(), EnvelopeOptions::new()).unwrap();
        assert_eq!(outer.innermost_content(), &Content::Payload(json!({"value": 7})));

        #[derive(Deserialize)]
        struct Value {
            value: u32,
        }
        assert_eq!(outer.decode::<Value>().unwrap().value, 7);
    }

    #[test]
    fn wire_form_keeps_timeout_in_millis() {
        let envelope = Envelope::new(
            json!("x"),
            sender(),
            EnvelopeOptions::new()
                .to(Endpoint::channel("alerts"))
                .timeout(Duration::from_millis(1500)),
        )
        .unwrap();
        let raw = serde_json::to_value(&envelope).unwrap();
        assert_eq!(raw["timeout"], json!(1500));
        let decoded: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn fault_content_does_not_decode() {
        let envelope = Envelope::new(
            RemoteFault::new("rejected", "nope"),
            sender(),
            EnvelopeOptions::new(),
        )
        .unwrap();
        assert!(matches!(
            envelope.decode::<String>(),
            Err(EnvelopeError::Codec(_))
        ));
    }
}
