//! MCP server supervising interactive background shells.
//!
//! stdout carries line-delimited JSON-RPC only; all diagnostics go to stderr
//! via `tracing`.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;

use mcp_types::JSONRPCMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod message_processor;
mod outgoing_message;
mod tools;

use crate::message_processor::MessageProcessor;
use crate::outgoing_message::OutgoingMessage;
use crate::outgoing_message::OutgoingMessageSender;
use crate::outgoing_message::OutgoingNotification;
use shellherd_core::ShellSupervisor;
use shellherd_core::SupervisorConfig;

/// Size of the bounded channel between the stdin reader and the processor.
const CHANNEL_CAPACITY: usize = 128;

/// Ready-marker notification emitted on stdout before requests are read.
pub const READY_NOTIFICATION_METHOD: &str = "shellherd/ready";

pub async fn run_main() -> IoResult<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let supervisor = ShellSupervisor::new(SupervisorConfig::from_env());

    let (incoming_tx, mut incoming_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutgoingMessage>();

    // --- Stdout writer ---
    let stdout_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(outgoing_message) = outgoing_rx.recv().await {
            let msg: JSONRPCMessage = outgoing_message.into();
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize JSON-RPC message: {e}"),
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    // The ready marker goes out before the stdin reader starts.
    let outgoing = OutgoingMessageSender::new(outgoing_tx);
    outgoing
        .send_notification(OutgoingNotification {
            method: READY_NOTIFICATION_METHOD.to_string(),
            params: None,
        })
        .await;

    // --- Stdin reader ---
    let stdin_handle = tokio::spawn(async move {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await.unwrap_or_default() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JSONRPCMessage>(&line) {
                Ok(msg) => {
                    if incoming_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to deserialize JSON-RPC message: {e}"),
            }
        }

        debug!("stdin reader finished (EOF)");
    });

    // --- Message processor ---
    let processor_handle = tokio::spawn({
        let supervisor = supervisor.clone();
        let mut processor = MessageProcessor::new(outgoing, supervisor);
        async move {
            while let Some(msg) = incoming_rx.recv().await {
                match msg {
                    JSONRPCMessage::Request(r) => processor.process_request(r).await,
                    JSONRPCMessage::Response(r) => processor.process_response(r).await,
                    JSONRPCMessage::Notification(n) => processor.process_notification(n).await,
                    JSONRPCMessage::Error(e) => processor.process_error(e),
                }
            }
            info!("processor task exited (channel closed)");
        }
    });

    // stdin EOF ends the reader; the closed channel ends the processor; the
    // dropped processor closes the outgoing channel and ends the writer.
    let _ = stdin_handle.await;
    let _ = processor_handle.await;
    supervisor.shutdown().await;
    let _ = stdout_handle.await;

    Ok(())
}
