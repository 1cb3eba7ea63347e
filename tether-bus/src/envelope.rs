//! Message envelope, the only cross-plugin wire contract.
//!
//! Serialized with camelCase field names and SCREAMING_CASE type tags:
//!
//! ```json
//! {"id":"acme.a:0190…","type":"REQUEST","senderId":"acme.a","receiverId":"acme.b",
//!  "channel":"sync","action":"pull","payload":{…},"timestamp":1718000000000,
//!  "requiresResponse":true,"responseTimeoutMs":30000}
//! ```

use crate::{BusError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tether_types::{MessageId, PluginId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Error,
}

/// An immutable message. Built by the bus from an [`OutgoingMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: MessageId,
    #[serde(rename = "type")]
    kind: MessageType,
    sender_id: PluginId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    receiver_id: Option<PluginId>,
    channel: String,
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    requires_response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlates_to_request_id: Option<MessageId>,
}

impl Envelope {
    pub(crate) fn from_outgoing(message: OutgoingMessage) -> Result<Self> {
        if message.channel.is_empty() {
            return Err(BusError::InvalidMessage("channel is required".into()));
        }
        if message.requires_response && message.receiver_id.is_none() {
            return Err(BusError::InvalidMessage(
                "a message expecting a response needs a receiver".into(),
            ));
        }
        Ok(Self {
            id: MessageId::for_sender(&message.sender_id),
            kind: message.kind,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            channel: message.channel,
            action: message.action,
            payload: message.payload,
            timestamp: Timestamp::now(),
            requires_response: message.requires_response.then_some(true),
            response_timeout_ms: message.response_timeout_ms,
            correlates_to_request_id: None,
        })
    }

    /// Broadcast copy addressed to one receiver.
    pub(crate) fn addressed_to(&self, receiver: &PluginId) -> Self {
        Self {
            receiver_id: Some(receiver.clone()),
            ..self.clone()
        }
    }

    /// RESPONSE correlated to `request`, sent back by its receiver.
    pub(crate) fn response_to(request: &Self, payload: Value) -> Self {
        Self::reply(request, MessageType::Response, payload)
    }

    /// ERROR correlated to `request`.
    pub(crate) fn error_to(request: &Self, message: &str) -> Self {
        Self::reply(
            request,
            MessageType::Error,
            serde_json::json!({ "error": message }),
        )
    }

    fn reply(request: &Self, kind: MessageType, payload: Value) -> Self {
        let responder = request
            .receiver_id
            .clone()
            .unwrap_or_else(|| request.sender_id.clone());
        Self {
            id: MessageId::for_sender(&responder),
            kind,
            sender_id: responder,
            receiver_id: Some(request.sender_id.clone()),
            channel: request.channel.clone(),
            action: request.action.clone(),
            payload: Some(payload),
            timestamp: Timestamp::now(),
            requires_response: None,
            response_timeout_ms: None,
            correlates_to_request_id: Some(request.id.clone()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    #[must_use]
    pub fn sender_id(&self) -> &PluginId {
        &self.sender_id
    }

    #[must_use]
    pub fn receiver_id(&self) -> Option<&PluginId> {
        self.receiver_id.as_ref()
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[must_use]
    pub fn requires_response(&self) -> bool {
        self.requires_response.unwrap_or(false)
    }

    #[must_use]
    pub fn response_timeout_ms(&self) -> Option<u64> {
        self.response_timeout_ms
    }

    #[must_use]
    pub fn correlates_to_request_id(&self) -> Option<&MessageId> {
        self.correlates_to_request_id.as_ref()
    }

    /// Consumes the envelope, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Option<Value> {
        self.payload
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// A message before the bus assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub kind: MessageType,
    pub sender_id: PluginId,
    /// `None` broadcasts to every other registered plugin.
    pub receiver_id: Option<PluginId>,
    pub channel: String,
    pub action: String,
    pub payload: Option<Value>,
    pub requires_response: bool,
    pub response_timeout_ms: Option<u64>,
}

impl OutgoingMessage {
    /// An EVENT with no receiver (a broadcast until [`Self::to`] is called).
    #[must_use]
    pub fn event(sender: PluginId, channel: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Event,
            sender_id: sender,
            receiver_id: None,
            channel: channel.into(),
            action: action.into(),
            payload: None,
            requires_response: false,
            response_timeout_ms: None,
        }
    }

    /// A REQUEST expecting a response.
    #[must_use]
    pub fn request(
        sender: PluginId,
        receiver: PluginId,
        channel: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageType::Request,
            receiver_id: Some(receiver),
            requires_response: true,
            ..Self::event(sender, channel, action)
        }
    }

    #[must_use]
    pub fn to(mut self, receiver: PluginId) -> Self {
        self.receiver_id = Some(receiver);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request() -> Envelope {
        let msg = OutgoingMessage::request(
            PluginId::new("acme.a"),
            PluginId::new("acme.b"),
            "sync",
            "pull",
        )
        .with_payload(json!({"since": 3}))
        .with_timeout(Duration::from_millis(250));
        Envelope::from_outgoing(msg).unwrap()
    }

    #[test]
    fn wire_format_uses_camel_case_and_screaming_tags() {
        let env = request();
        let wire: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(wire["type"], "REQUEST");
        assert_eq!(wire["senderId"], "acme.a");
        assert_eq!(wire["receiverId"], "acme.b");
        assert_eq!(wire["requiresResponse"], true);
        assert_eq!(wire["responseTimeoutMs"], 250);
        assert!(wire.get("correlatesToRequestId").is_none());
        assert!(wire["id"].as_str().unwrap().starts_with("acme.a:"));
    }

    #[test]
    fn response_correlates_to_request() {
        let req = request();
        let resp = Envelope::response_to(&req, json!("ok"));
        assert_eq!(resp.kind(), MessageType::Response);
        assert_eq!(resp.correlates_to_request_id(), Some(req.id()));
        assert_eq!(resp.sender_id().as_str(), "acme.b");
        assert_eq!(resp.receiver_id().map(PluginId::as_str), Some("acme.a"));

        let err = Envelope::error_to(&req, "nope");
        assert_eq!(err.kind(), MessageType::Error);
        assert_eq!(err.payload(), Some(&json!({"error": "nope"})));
    }

    #[test]
    fn parses_foreign_envelope() {
        let json = r#"{"id":"x:1","type":"EVENT","senderId":"x","channel":"c","action":"a","timestamp":5}"#;
        let env = Envelope::from_json(json).unwrap();
        assert_eq!(env.kind(), MessageType::Event);
        assert!(!env.requires_response());
        assert_eq!(env.timestamp(), Timestamp::from_millis(5));
    }

    #[test]
    fn response_without_receiver_is_rejected() {
        let mut msg = OutgoingMessage::event(PluginId::new("a"), "c", "x");
        msg.requires_response = true;
        assert!(Envelope::from_outgoing(msg).is_err());
    }
}
