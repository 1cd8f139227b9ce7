//! The tool table: names, argument shapes (as data), and the argument
//! structs the dispatcher deserializes tool calls into.

use mcp_types::Tool;
use mcp_types::ToolInputSchema;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use shellherd_core::DEFAULT_CHECK_LOG_LINES;

pub(crate) const START_SHELL: &str = "start_shell";
pub(crate) const CHECK_SHELL: &str = "check_shell";
pub(crate) const SEND_INPUT: &str = "send_input";
pub(crate) const STOP_SHELL: &str = "stop_shell";
pub(crate) const LIST_SHELLS: &str = "list_shells";

#[derive(Debug, Deserialize)]
pub(crate) struct CheckShellArgs {
    pub label: String,
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendInputArgs {
    pub label: String,
    pub input: String,
    #[serde(default = "default_append_newline")]
    pub append_newline: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StopShellArgs {
    pub label: String,
    #[serde(default)]
    pub force: bool,
}

fn default_log_lines() -> usize {
    DEFAULT_CHECK_LOG_LINES
}

fn default_append_newline() -> bool {
    true
}

pub(crate) fn all_tools() -> Vec<Tool> {
    vec![
        start_shell_tool(),
        check_shell_tool(),
        send_input_tool(),
        stop_shell_tool(),
        list_shells_tool(),
    ]
}

fn object_schema(properties: Value, required: &[&str]) -> ToolInputSchema {
    ToolInputSchema {
        r#type: "object".to_string(),
        properties: Some(properties),
        required: if required.is_empty() {
            None
        } else {
            Some(required.iter().map(|name| name.to_string()).collect())
        },
    }
}

fn start_shell_tool() -> Tool {
    Tool {
        name: START_SHELL.to_string(),
        description: Some(
            "Start a command under a pty and register it under a unique label. \
             Returns a status snapshot; a command that cannot be spawned yields \
             status \"crashed\" with the failure in its logs."
                .to_string(),
        ),
        input_schema: object_schema(
            json!({
                "command": { "type": "string", "description": "Program to launch." },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Arguments passed to the program."
                },
                "workingDirectory": { "type": "string" },
                "label": {
                    "type": "string",
                    "description": "Caller-chosen unique identifier for this shell."
                },
                "verification_pattern": {
                    "type": "string",
                    "description": "Regex; the shell stays in \"verifying\" until output matches."
                },
                "verification_timeout_ms": { "type": "integer", "minimum": 1 },
                "notable_pattern": {
                    "type": "string",
                    "description": "Extra regex counted as a notable event."
                },
                "env": {
                    "type": "object",
                    "additionalProperties": { "type": "string" }
                }
            }),
            &["command", "label"],
        ),
    }
}

fn check_shell_tool() -> Tool {
    Tool {
        name: CHECK_SHELL.to_string(),
        description: Some(
            "Poll a shell: status, a one-line summary of notable events since \
             the last poll, and the new log lines."
                .to_string(),
        ),
        input_schema: object_schema(
            json!({
                "label": { "type": "string" },
                "log_lines": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Most recent unseen lines to return (default 50, 0 = none)."
                }
            }),
            &["label"],
        ),
    }
}

fn send_input_tool() -> Tool {
    Tool {
        name: SEND_INPUT.to_string(),
        description: Some(
            "Write keystrokes to a running shell's pty, wait briefly for the \
             output to settle, and return the resulting snapshot."
                .to_string(),
        ),
        input_schema: object_schema(
            json!({
                "label": { "type": "string" },
                "input": { "type": "string" },
                "append_newline": { "type": "boolean", "default": true }
            }),
            &["label", "input"],
        ),
    }
}

fn stop_shell_tool() -> Tool {
    Tool {
        name: STOP_SHELL.to_string(),
        description: Some(
            "Stop a shell: graceful interrupt with SIGKILL escalation, or \
             immediate SIGKILL with force=true. Idempotent."
                .to_string(),
        ),
        input_schema: object_schema(
            json!({
                "label": { "type": "string" },
                "force": { "type": "boolean", "default": false }
            }),
            &["label"],
        ),
    }
}

fn list_shells_tool() -> Tool {
    Tool {
        name: LIST_SHELLS.to_string(),
        description: Some("List every managed shell with its status and pid.".to_string()),
        input_schema: object_schema(json!({}), &[]),
    }
}
