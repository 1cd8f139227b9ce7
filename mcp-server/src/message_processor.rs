//! Request dispatch: binds the tool vocabulary to supervisor operations.

use std::sync::Arc;

use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::ContentBlock;
use mcp_types::Implementation;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::INVALID_REQUEST_ERROR_CODE;
use mcp_types::ListToolsResult;
use mcp_types::MCP_SCHEMA_VERSION;
use mcp_types::METHOD_NOT_FOUND_ERROR_CODE;
use mcp_types::RequestId;
use mcp_types::ServerCapabilities;
use mcp_types::ServerCapabilitiesTools;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use shellherd_core::ShellSupervisor;
use shellherd_core::StartShellParams;
use shellherd_core::SupervisorError;

use crate::outgoing_message::OutgoingMessageSender;
use crate::tools;
use crate::tools::CheckShellArgs;
use crate::tools::SendInputArgs;
use crate::tools::StopShellArgs;

pub(crate) struct MessageProcessor {
    outgoing: Arc<OutgoingMessageSender>,
    initialized: bool,
    supervisor: Arc<ShellSupervisor>,
}

impl MessageProcessor {
    pub(crate) fn new(outgoing: OutgoingMessageSender, supervisor: Arc<ShellSupervisor>) -> Self {
        Self {
            outgoing: Arc::new(outgoing),
            initialized: false,
            supervisor,
        }
    }

    pub(crate) async fn process_request(&mut self, request: JSONRPCRequest) {
        let JSONRPCRequest {
            id, method, params, ..
        } = request;

        match method.as_str() {
            "initialize" => self.handle_initialize(id, params).await,
            "ping" => self.outgoing.send_response(id, json!({})).await,
            "tools/list" => {
                let result = ListToolsResult {
                    tools: tools::all_tools(),
                    next_cursor: None,
                };
                self.outgoing.send_response(id, result).await;
            }
            "tools/call" => self.handle_call_tool(id, params).await,
            other => {
                self.outgoing
                    .send_error(id, JSONRPCErrorError {
                        code: METHOD_NOT_FOUND_ERROR_CODE,
                        message: format!("unknown method '{other}'"),
                        data: None,
                    })
                    .await;
            }
        }
    }

    pub(crate) async fn process_response(&mut self, response: JSONRPCResponse) {
        debug!("<- response: {response:?}");
    }

    pub(crate) async fn process_notification(&mut self, notification: JSONRPCNotification) {
        debug!("<- notification: {}", notification.method);
    }

    pub(crate) fn process_error(&mut self, error: JSONRPCError) {
        warn!("<- error: {error:?}");
    }

    async fn handle_initialize(&mut self, id: RequestId, params: Option<serde_json::Value>) {
        if self.initialized {
            self.outgoing
                .send_error(id, JSONRPCErrorError {
                    code: INVALID_REQUEST_ERROR_CODE,
                    message: "initialize called more than once".to_string(),
                    data: None,
                })
                .await;
            return;
        }
        self.initialized = true;

        let protocol_version = params
            .and_then(|value| serde_json::from_value::<InitializeRequestParams>(value).ok())
            .map(|params| params.protocol_version)
            .unwrap_or_else(|| MCP_SCHEMA_VERSION.to_string());

        let result = InitializeResult {
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
            },
            instructions: None,
            protocol_version,
            server_info: Implementation {
                name: "shellherd-mcp-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Shellherd".to_string()),
            },
        };
        self.outgoing.send_response(id, result).await;
    }

    async fn handle_call_tool(&self, id: RequestId, params: Option<serde_json::Value>) {
        let params = match params
            .map(serde_json::from_value::<CallToolRequestParams>)
            .transpose()
        {
            Ok(Some(params)) => params,
            Ok(None) => {
                self.send_tool_result(id, error_result("BadArguments", "missing tool-call params"))
                    .await;
                return;
            }
            Err(err) => {
                self.send_tool_result(
                    id,
                    error_result("BadArguments", &format!("malformed tool-call params: {err}")),
                )
                .await;
                return;
            }
        };

        let CallToolRequestParams { name, arguments } = params;
        let arguments = arguments.unwrap_or_else(|| json!({}));

        let result = match name.as_str() {
            tools::START_SHELL => match parse_args::<StartShellParams>(arguments) {
                Ok(args) => self
                    .supervisor
                    .start_shell(args)
                    .await
                    .map(|snapshot| json_result(&snapshot))
                    .unwrap_or_else(|err| supervisor_error_result(&err)),
                Err(result) => result,
            },
            tools::CHECK_SHELL => match parse_args::<CheckShellArgs>(arguments) {
                Ok(args) => self
                    .supervisor
                    .check_shell(&args.label, args.log_lines)
                    .await
                    .map(|snapshot| json_result(&snapshot))
                    .unwrap_or_else(|err| supervisor_error_result(&err)),
                Err(result) => result,
            },
            tools::SEND_INPUT => match parse_args::<SendInputArgs>(arguments) {
                Ok(args) => self
                    .supervisor
                    .send_input(&args.label, &args.input, args.append_newline)
                    .await
                    .map(|snapshot| json_result(&snapshot))
                    .unwrap_or_else(|err| supervisor_error_result(&err)),
                Err(result) => result,
            },
            tools::STOP_SHELL => match parse_args::<StopShellArgs>(arguments) {
                Ok(args) => self
                    .supervisor
                    .stop_shell(&args.label, args.force)
                    .await
                    .map(|snapshot| json_result(&snapshot))
                    .unwrap_or_else(|err| supervisor_error_result(&err)),
                Err(result) => result,
            },
            tools::LIST_SHELLS => {
                let shells = self.supervisor.list_shells().await;
                json_result(&shells)
            }
            other => error_result("BadArguments", &format!("unknown tool '{other}'")),
        };

        self.send_tool_result(id, result).await;
    }

    async fn send_tool_result(&self, id: RequestId, result: CallToolResult) {
        self.outgoing.send_response(id, result).await;
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: serde_json::Value,
) -> Result<T, CallToolResult> {
    serde_json::from_value(arguments)
        .map_err(|err| error_result("BadArguments", &format!("invalid arguments: {err}")))
}

/// Success envelope: the snapshot JSON as a single text payload.
fn json_result<T: Serialize>(body: &T) -> CallToolResult {
    match serde_json::to_string(body) {
        Ok(text) => CallToolResult {
            content: vec![ContentBlock::text(text)],
            is_error: None,
        },
        Err(err) => error_result("Internal", &format!("failed to encode snapshot: {err}")),
    }
}

fn supervisor_error_result(err: &SupervisorError) -> CallToolResult {
    error_result(err.kind(), &err.to_string())
}

fn error_result(kind: &str, message: &str) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::text(format!("{kind}: {message}"))],
        is_error: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::JSONRPC_VERSION;
    use mcp_types::JSONRPCMessage;
    use pretty_assertions::assert_eq;
    use shellherd_core::SupervisorConfig;
    use tokio::sync::mpsc;

    use crate::outgoing_message::OutgoingMessage;

    struct Harness {
        processor: MessageProcessor,
        outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    }

    fn harness() -> Harness {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let supervisor = ShellSupervisor::new(SupervisorConfig::fast());
        let processor =
            MessageProcessor::new(OutgoingMessageSender::new(outgoing_tx), supervisor);
        Harness {
            processor,
            outgoing_rx,
        }
    }

    fn request(id: i64, method: &str, params: serde_json::Value) -> JSONRPCRequest {
        JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Integer(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    async fn next_response(harness: &mut Harness) -> serde_json::Value {
        let outgoing = match harness.outgoing_rx.recv().await {
            Some(msg) => msg,
            None => panic!("outgoing channel closed"),
        };
        match JSONRPCMessage::from(outgoing) {
            JSONRPCMessage::Response(response) => response.result,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    fn tool_body(result: &serde_json::Value) -> (serde_json::Value, bool) {
        let is_error = result
            .get("isError")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let text = result["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if is_error {
            (serde_json::Value::String(text), true)
        } else {
            match serde_json::from_str(&text) {
                Ok(body) => (body, false),
                Err(e) => panic!("tool body is not JSON ({e}): {text}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initialize_twice_is_an_error() {
        let mut h = harness();
        h.processor
            .process_request(request(1, "initialize", json!({"protocolVersion": "2025-06-18"})))
            .await;
        let result = next_response(&mut h).await;
        assert_eq!(result["serverInfo"]["name"], "shellherd-mcp-server");

        h.processor
            .process_request(request(2, "initialize", json!({})))
            .await;
        let outgoing = match h.outgoing_rx.recv().await {
            Some(msg) => msg,
            None => panic!("outgoing channel closed"),
        };
        match JSONRPCMessage::from(outgoing) {
            JSONRPCMessage::Error(err) => {
                assert_eq!(err.error.code, INVALID_REQUEST_ERROR_CODE);
            }
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tools_list_names_the_tool_surface() {
        let mut h = harness();
        h.processor
            .process_request(request(1, "tools/list", json!({})))
            .await;
        let result = next_response(&mut h).await;
        let names: Vec<&str> = result["tools"]
            .as_array()
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| tool["name"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(names, vec![
            "start_shell",
            "check_shell",
            "send_input",
            "stop_shell",
            "list_shells"
        ]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_method_gets_a_jsonrpc_error() {
        let mut h = harness();
        h.processor
            .process_request(request(5, "resources/list", json!({})))
            .await;
        let outgoing = match h.outgoing_rx.recv().await {
            Some(msg) => msg,
            None => panic!("outgoing channel closed"),
        };
        match JSONRPCMessage::from(outgoing) {
            JSONRPCMessage::Error(err) => {
                assert_eq!(err.error.code, METHOD_NOT_FOUND_ERROR_CODE);
            }
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_tool_and_unknown_label_are_tool_errors() {
        let mut h = harness();
        h.processor
            .process_request(request(
                1,
                "tools/call",
                json!({ "name": "resize_shell", "arguments": {} }),
            ))
            .await;
        let result = next_response(&mut h).await;
        let (body, is_error) = tool_body(&result);
        assert!(is_error);
        assert!(body.as_str().unwrap_or_default().contains("unknown tool"));

        h.processor
            .process_request(request(
                2,
                "tools/call",
                json!({ "name": "check_shell", "arguments": { "label": "ghost" } }),
            ))
            .await;
        let result = next_response(&mut h).await;
        let (body, is_error) = tool_body(&result);
        assert!(is_error);
        assert!(body.as_str().unwrap_or_default().starts_with("NotFound:"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_check_stop_round_trip() {
        let mut h = harness();
        h.processor
            .process_request(request(
                1,
                "tools/call",
                json!({
                    "name": "start_shell",
                    "arguments": {
                        "command": "/bin/bash",
                        "args": ["-c", "echo hello; sleep 5"],
                        "label": "greeter"
                    }
                }),
            ))
            .await;
        let (body, is_error) = tool_body(&next_response(&mut h).await);
        assert!(!is_error);
        assert_eq!(body["label"], "greeter");
        assert_eq!(body["status"], "active");

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        h.processor
            .process_request(request(
                2,
                "tools/call",
                json!({ "name": "check_shell", "arguments": { "label": "greeter" } }),
            ))
            .await;
        let (body, is_error) = tool_body(&next_response(&mut h).await);
        assert!(!is_error);
        let logs = body["logs"].as_array().cloned().unwrap_or_default();
        assert!(
            logs.iter()
                .any(|line| line.as_str().unwrap_or_default().contains("hello")),
            "missing hello in {logs:?}"
        );

        h.processor
            .process_request(request(
                3,
                "tools/call",
                json!({ "name": "stop_shell", "arguments": { "label": "greeter", "force": true } }),
            ))
            .await;
        let (body, is_error) = tool_body(&next_response(&mut h).await);
        assert!(!is_error);
        let status = body["status"].as_str().unwrap_or_default();
        assert!(
            status == "stopping" || status == "stopped",
            "unexpected status {status}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_shells_returns_minimal_entries() {
        let mut h = harness();
        h.processor
            .process_request(request(
                1,
                "tools/call",
                json!({
                    "name": "start_shell",
                    "arguments": {
                        "command": "/bin/bash",
                        "args": ["-c", "sleep 5"],
                        "label": "listed"
                    }
                }),
            ))
            .await;
        let _ = next_response(&mut h).await;

        h.processor
            .process_request(request(2, "tools/call", json!({ "name": "list_shells" })))
            .await;
        let (body, is_error) = tool_body(&next_response(&mut h).await);
        assert!(!is_error);
        let entries = body.as_array().cloned().unwrap_or_default();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["label"], "listed");
        assert_eq!(entries[0]["status"], "active");
        assert!(entries[0]["pid"].is_number());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashed_spawn_is_a_normal_result() {
        let mut h = harness();
        h.processor
            .process_request(request(
                1,
                "tools/call",
                json!({
                    "name": "start_shell",
                    "arguments": { "command": "/nonexistent/program", "label": "ghost" }
                }),
            ))
            .await;
        let (body, is_error) = tool_body(&next_response(&mut h).await);
        assert!(!is_error, "spawn failure must not set isError");
        assert_eq!(body["status"], "crashed");
        let logs = body["logs"].as_array().cloned().unwrap_or_default();
        assert!(
            logs.iter()
                .any(|line| line.as_str().unwrap_or_default().contains("failed to spawn")),
            "missing spawn diagnostics in {logs:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_label_is_a_tool_error() {
        let mut h = harness();
        for id in [1, 2] {
            h.processor
                .process_request(request(
                    id,
                    "tools/call",
                    json!({
                        "name": "start_shell",
                        "arguments": {
                            "command": "/bin/bash",
                            "args": ["-c", "sleep 5"],
                            "label": "dup"
                        }
                    }),
                ))
                .await;
        }
        let (_, first_is_error) = tool_body(&next_response(&mut h).await);
        let (second_body, second_is_error) = tool_body(&next_response(&mut h).await);
        assert!(!first_is_error);
        assert!(second_is_error);
        assert!(
            second_body
                .as_str()
                .unwrap_or_default()
                .starts_with("DuplicateLabel:")
        );
    }
}
