use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffer::TransferBuffer;

/// Reply state for a task that completed.
pub const STATE_SUCCESS: &str = "success";

/// Reply state for a task that failed or was not recognized.
pub const STATE_ERROR: &str = "error";

/// Envelope crossing a transport.
///
/// The payload is MessagePack-encoded with named fields so both sides agree
/// on the logical `{task, args}` / `{state, data | reason}` shapes. Buffers
/// listed in `transfer` travel alongside the payload and are never encoded.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Vec<u8>,

    /// Buffers moved to the receiver with this message.
    pub transfer: Vec<TransferBuffer>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(payload: &T) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            payload: rmp_serde::to_vec_named(payload)?,
            transfer: Vec::new(),
            timestamp: Utc::now(),
        })
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }
}

/// Request sent from the pool to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Reply exactly as it appears on the wire.
///
/// `state` is kept as a plain string so a peer speaking an unknown state can
/// be detected instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReplyFrame {
    pub fn success(data: Value) -> Self {
        Self {
            state: STATE_SUCCESS.into(),
            data: Some(data),
            reason: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            state: STATE_ERROR.into(),
            data: None,
            reason: Some(reason.into()),
        }
    }
}

/// A reply whose state was recognized.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReply {
    Success(Value),
    Error(String),
}

impl TryFrom<ReplyFrame> for TaskReply {
    /// The unrecognized state.
    type Error = String;

    fn try_from(frame: ReplyFrame) -> Result<Self, String> {
        match frame.state.as_str() {
            STATE_SUCCESS => Ok(TaskReply::Success(frame.data.unwrap_or(Value::Null))),
            STATE_ERROR => Ok(TaskReply::Error(frame.reason.unwrap_or_default())),
            _ => Err(frame.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_keeps_argument_order() {
        let req = TaskRequest {
            task: "addNumbers".into(),
            args: vec![json!(9), json!(23), json!({"nested": [1, 2]})],
        };
        let msg = Message::new(&req).unwrap();
        let decoded: TaskRequest = msg.decode().unwrap();
        assert_eq!(decoded, req);
        assert!(msg.transfer.is_empty());
    }

    #[test]
    fn success_reply_with_null_data() {
        let msg = Message::new(&ReplyFrame::success(Value::Null)).unwrap();
        let frame: ReplyFrame = msg.decode().unwrap();
        assert_eq!(TaskReply::try_from(frame), Ok(TaskReply::Success(Value::Null)));
    }

    #[test]
    fn error_reply_carries_reason() {
        let msg = Message::new(&ReplyFrame::error("boom")).unwrap();
        let frame: ReplyFrame = msg.decode().unwrap();
        assert_eq!(
            TaskReply::try_from(frame),
            Ok(TaskReply::Error("boom".into()))
        );
    }

    #[test]
    fn unknown_state_is_reported() {
        let frame = ReplyFrame {
            state: "pending".into(),
            data: None,
            reason: None,
        };
        assert_eq!(TaskReply::try_from(frame), Err("pending".to_string()));
    }

    #[test]
    fn request_without_args_field_decodes() {
        #[derive(Serialize)]
        struct Bare {
            task: &'static str,
        }
        let msg = Message::new(&Bare { task: "simpleTask" }).unwrap();
        let decoded: TaskRequest = msg.decode().unwrap();
        assert_eq!(decoded.task, "simpleTask");
        assert!(decoded.args.is_empty());
    }
}
