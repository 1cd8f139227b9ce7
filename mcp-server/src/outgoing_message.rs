//! Messages queued for the stdout writer task.

use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCResponse;
use mcp_types::JSONRPC_VERSION;
use mcp_types::RequestId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

#[derive(Debug)]
pub(crate) enum OutgoingMessage {
    Response(OutgoingResponse),
    Error(OutgoingError),
    Notification(OutgoingNotification),
}

#[derive(Debug)]
pub(crate) struct OutgoingResponse {
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug)]
pub(crate) struct OutgoingError {
    pub id: RequestId,
    pub error: JSONRPCErrorError,
}

#[derive(Debug)]
pub(crate) struct OutgoingNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl From<OutgoingMessage> for JSONRPCMessage {
    fn from(message: OutgoingMessage) -> Self {
        match message {
            OutgoingMessage::Response(OutgoingResponse { id, result }) => {
                JSONRPCMessage::Response(JSONRPCResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    result,
                })
            }
            OutgoingMessage::Error(OutgoingError { id, error }) => {
                JSONRPCMessage::Error(JSONRPCError {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    error,
                })
            }
            OutgoingMessage::Notification(OutgoingNotification { method, params }) => {
                JSONRPCMessage::Notification(JSONRPCNotification {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    method,
                    params,
                })
            }
        }
    }
}

/// Handle the dispatcher uses to enqueue messages for stdout.
#[derive(Debug)]
pub(crate) struct OutgoingMessageSender {
    sender: mpsc::UnboundedSender<OutgoingMessage>,
}

impl OutgoingMessageSender {
    pub(crate) fn new(sender: mpsc::UnboundedSender<OutgoingMessage>) -> Self {
        Self { sender }
    }

    pub(crate) async fn send_response(&self, id: RequestId, result: impl Serialize) {
        match serde_json::to_value(result) {
            Ok(result) => {
                let _ = self
                    .sender
                    .send(OutgoingMessage::Response(OutgoingResponse { id, result }));
            }
            Err(err) => error!("failed to serialize response for id {id}: {err}"),
        }
    }

    pub(crate) async fn send_error(&self, id: RequestId, error: JSONRPCErrorError) {
        let _ = self
            .sender
            .send(OutgoingMessage::Error(OutgoingError { id, error }));
    }

    pub(crate) async fn send_notification(&self, notification: OutgoingNotification) {
        let _ = self.sender.send(OutgoingMessage::Notification(notification));
    }
}
