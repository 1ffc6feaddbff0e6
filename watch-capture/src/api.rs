use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use watch_common::event::{CandidateEvent, EventError};

/// Messages the observing context sends into a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Health check, always acknowledged with `ok`.
    Ping,
    /// A candidate event to filter and, if accepted, queue for delivery.
    VideoEvent(CandidateEvent),
}

/// The JSON shape of a message: `{ "type": "VIDEO_EVENT", "data": {...} }`.
#[derive(Deserialize, Serialize)]
struct WireMessage {
    r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

const PING: &str = "PING";
const VIDEO_EVENT: &str = "VIDEO_EVENT";
const LEGACY_VIDEO_EVENT: &str = "YOUTUBE_VIDEO";

impl Message {
    /// Decode a message from its JSON form. Anything malformed is reported as
    /// a `MessageError`, to be turned into an error acknowledgement.
    pub fn from_json(bytes: &[u8]) -> Result<Message, MessageError> {
        let wire: WireMessage =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Decode(e.to_string()))?;

        match wire.r#type.as_str() {
            PING => Ok(Message::Ping),
            VIDEO_EVENT | LEGACY_VIDEO_EVENT => {
                let data = wire.data.unwrap_or_else(|| Value::Object(Default::default()));
                Ok(Message::VideoEvent(CandidateEvent::try_from(data)?))
            }
            other => Err(MessageError::UnknownType(other.to_owned())),
        }
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        let wire = match self {
            Message::Ping => WireMessage {
                r#type: PING.to_owned(),
                data: None,
            },
            Message::VideoEvent(event) => WireMessage {
                r#type: VIDEO_EVENT.to_owned(),
                data: Some(serde_json::to_value(event)?),
            },
        };

        serde_json::to_value(wire)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::VideoEvent(_) => "video_event",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error(transparent)]
    InvalidEvent(#[from] EventError),
    #[error("pipeline is not running")]
    PipelineStopped,
}

/// Immediate acknowledgement of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            ok: true,
            skipped: Some(true),
            ..Default::default()
        }
    }

    pub fn queued() -> Self {
        Self {
            ok: true,
            queued: Some(true),
            ..Default::default()
        }
    }

    pub fn rejected(error: &MessageError) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

impl IntoResponse for Ack {
    fn into_response(self) -> Response {
        let status = if self.ok {
            StatusCode::OK
        } else {
            StatusCode::BAD_REQUEST
        };

        (status, Json(self)).into_response()
    }
}

pub(crate) struct Envelope {
    pub message: Message,
    pub reply: oneshot::Sender<Ack>,
}

/// Create the message channel into a pipeline.
pub fn channel(buffer: usize) -> (PipelineHandle, PipelineInbox) {
    let (sender, receiver) = mpsc::channel(buffer);
    (PipelineHandle { sender }, PipelineInbox { receiver })
}

/// Sending side of the message channel. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    sender: mpsc::Sender<Envelope>,
}

impl PipelineHandle {
    /// Send a message and wait for its acknowledgement.
    pub async fn send(&self, message: Message) -> Ack {
        let (reply, response) = oneshot::channel();

        if self.sender.send(Envelope { message, reply }).await.is_err() {
            return Ack::rejected(&MessageError::PipelineStopped);
        }

        response
            .await
            .unwrap_or_else(|_| Ack::rejected(&MessageError::PipelineStopped))
    }

    /// Decode and send a JSON message. Malformed messages are rejected here
    /// and never reach the pipeline.
    pub async fn send_json(&self, bytes: &[u8]) -> Ack {
        match Message::from_json(bytes) {
            Ok(message) => self.send(message).await,
            Err(err) => {
                tracing::warn!("rejected malformed message: {}", err);
                metrics::counter!("watch_messages_total", "type" => "unknown", "outcome" => "rejected")
                    .increment(1);
                Ack::rejected(&err)
            }
        }
    }
}

/// Receiving side of the message channel, owned by the pipeline task.
pub struct PipelineInbox {
    receiver: mpsc::Receiver<Envelope>,
}

impl PipelineInbox {
    /// Receive the next message along with the function to acknowledge it.
    pub async fn recv(&mut self) -> Option<(Message, Responder)> {
        self.receiver
            .recv()
            .await
            .map(|envelope| (envelope.message, Responder(envelope.reply)))
    }
}

/// Acknowledges exactly one message.
pub struct Responder(oneshot::Sender<Ack>);

impl Responder {
    pub fn respond(self, ack: Ack) {
        // The message was handled even if the sender stopped waiting.
        if self.0.send(ack).is_err() {
            tracing::debug!("sender dropped before acknowledgement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn decodes_ping() {
        assert_eq!(Message::from_json(br#"{"type":"PING"}"#), Ok(Message::Ping));
    }

    #[test]
    fn decodes_video_event_and_legacy_name() {
        for kind in ["VIDEO_EVENT", "YOUTUBE_VIDEO"] {
            let body = json!({
                "type": kind,
                "data": {"videoId": "abc123", "ts": 1, "url": "u", "title": "t"},
            });
            match Message::from_json(body.to_string().as_bytes()) {
                Ok(Message::VideoEvent(event)) => {
                    assert_eq!(event.subject_id(), "abc123");
                    assert_eq!(event.attribute("title"), Some("t"));
                }
                other => panic!("unexpected decode result {:?}", other),
            }
        }
    }

    #[test]
    fn rejects_malformed_messages() {
        let missing_subject = Message::from_json(br#"{"type":"VIDEO_EVENT","data":{"title":"t"}}"#);
        assert_eq!(
            missing_subject,
            Err(MessageError::InvalidEvent(EventError::MissingSubject))
        );
        assert_eq!(
            Ack::rejected(&missing_subject.unwrap_err()).error.as_deref(),
            Some("missing videoId")
        );

        assert_eq!(
            Message::from_json(br#"{"type":"VIDEO_EVENT"}"#),
            Err(MessageError::InvalidEvent(EventError::MissingSubject))
        );
        assert_eq!(
            Message::from_json(br#"{"type":"NOPE"}"#),
            Err(MessageError::UnknownType("NOPE".to_owned()))
        );
        assert!(matches!(
            Message::from_json(b"not json"),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn ack_wire_shapes() {
        assert_json_eq!(serde_json::to_value(Ack::ok()).unwrap(), json!({"ok": true}));
        assert_json_eq!(
            serde_json::to_value(Ack::skipped()).unwrap(),
            json!({"ok": true, "skipped": true})
        );
        assert_json_eq!(
            serde_json::to_value(Ack::queued()).unwrap(),
            json!({"ok": true, "queued": true})
        );
        assert_json_eq!(
            serde_json::to_value(Ack::rejected(&MessageError::PipelineStopped)).unwrap(),
            json!({"ok": false, "error": "pipeline is not running"})
        );
    }

    #[test]
    fn message_round_trips_through_json() {
        let event = CandidateEvent::try_from(json!({"videoId": "abc123", "ts": 3, "url": "u"}))
            .unwrap();
        let message = Message::VideoEvent(event);

        let encoded = message.to_json().unwrap();
        assert_eq!(encoded["type"], "VIDEO_EVENT");
        assert_eq!(
            Message::from_json(encoded.to_string().as_bytes()),
            Ok(message)
        );
    }

    #[tokio::test]
    async fn stopped_pipeline_rejects() {
        let (handle, inbox) = channel(1);
        drop(inbox);

        assert_eq!(
            handle.send(Message::Ping).await,
            Ack::rejected(&MessageError::PipelineStopped)
        );
    }

    #[tokio::test]
    async fn responding_after_the_sender_gave_up() {
        let (handle, mut inbox) = channel(1);
        let waiting = tokio::spawn(async move { handle.send(Message::Ping).await });

        let (message, responder) = inbox.recv().await.unwrap();
        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());

        assert_eq!(message, Message::Ping);
        responder.respond(Ack::ok());
    }
}
