//! Built-in handlers declared in configuration.
//!
//! Each [`HandlerAction`] maps to one handler type here, so a handler set can be loaded
//! from YAML without writing code.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, error, info, trace, warn, Level};

use crate::domain::models::{
    Event, HandlerAction, HandlerConfig, HandlerContext, HandlerDescriptor, HandlerError,
    HandlerOutput,
};
use crate::domain::ports::Handler;

/// Build the handler for a configuration declaration.
pub fn from_config(config: &HandlerConfig) -> Arc<dyn Handler> {
    let descriptor = config.descriptor();
    match &config.action {
        HandlerAction::LogMessage { level, message } => Arc::new(LogMessageHandler {
            descriptor,
            level: level.parse().unwrap_or(Level::INFO),
            message: message.clone(),
        }),
        HandlerAction::RunScript { command, args } => Arc::new(RunScriptHandler {
            descriptor,
            command: command.clone(),
            args: args.clone(),
        }),
        HandlerAction::Block { reason } => Arc::new(BlockHandler {
            descriptor,
            reason: reason.clone(),
        }),
        HandlerAction::Respond { data } => Arc::new(RespondHandler {
            descriptor,
            data: data.clone(),
        }),
    }
}

/// Logs a fixed message for every matching event.
pub struct LogMessageHandler {
    descriptor: HandlerDescriptor,
    level: Level,
    message: String,
}

#[async_trait]
impl Handler for LogMessageHandler {
    fn describe(&self) -> HandlerDescriptor {
        self.descriptor.clone()
    }

    async fn execute(
        &self,
        event: &Event,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let handler_id = self.descriptor.id.as_str();
        let kind = event.kind().as_str();
        let operation = event.operation();
        let message = self.message.as_str();
        let dispatch_id = ctx.dispatch_id;
        match self.level {
            Level::ERROR => error!(handler_id, kind, operation, %dispatch_id, "{message}"),
            Level::WARN => warn!(handler_id, kind, operation, %dispatch_id, "{message}"),
            Level::DEBUG => debug!(handler_id, kind, operation, %dispatch_id, "{message}"),
            Level::TRACE => trace!(handler_id, kind, operation, %dispatch_id, "{message}"),
            _ => info!(handler_id, kind, operation, %dispatch_id, "{message}"),
        }
        Ok(HandlerOutput::empty())
    }
}

/// Runs an external command with the event exposed through environment variables.
///
/// Stdout that parses as JSON becomes the handler's data; any other non-empty stdout is
/// returned as a string. A non-zero exit status is a failure. The child is killed when
/// the dispatcher stops waiting for it.
pub struct RunScriptHandler {
    descriptor: HandlerDescriptor,
    command: String,
    args: Vec<String>,
}

#[async_trait]
impl Handler for RunScriptHandler {
    fn describe(&self) -> HandlerDescriptor {
        self.descriptor.clone()
    }

    async fn execute(
        &self,
        event: &Event,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        debug!(command = %self.command, args = ?self.args, "Running handler script");

        let payload = serde_json::to_string(event.payload())
            .map_err(|e| HandlerError::new(format!("Failed to encode payload: {e}")))?;

        let output = Command::new(&self.command)
            .args(&self.args)
            .env("HOOKGATE_EVENT_ID", event.id().to_string())
            .env("HOOKGATE_EVENT_KIND", event.kind().as_str())
            .env("HOOKGATE_EVENT_PHASE", event.phase().as_str())
            .env("HOOKGATE_EVENT_PRIORITY", event.priority().as_str())
            .env("HOOKGATE_OPERATION", event.operation())
            .env("HOOKGATE_PAYLOAD", payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HandlerError::new(format!("Failed to execute {}: {e}", self.command)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HandlerError::new(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(HandlerOutput::empty());
        }
        let data = serde_json::from_str::<Value>(stdout).unwrap_or_else(|_| json!(stdout));
        Ok(HandlerOutput::with_data(data))
    }
}

/// Always fails. Used to veto operations from configuration.
pub struct BlockHandler {
    descriptor: HandlerDescriptor,
    reason: String,
}

#[async_trait]
impl Handler for BlockHandler {
    fn describe(&self) -> HandlerDescriptor {
        self.descriptor.clone()
    }

    async fn execute(
        &self,
        _event: &Event,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        Err(HandlerError::new(self.reason.clone()))
    }
}

/// Returns the same data for every event.
pub struct RespondHandler {
    descriptor: HandlerDescriptor,
    data: Value,
}

#[async_trait]
impl Handler for RespondHandler {
    fn describe(&self) -> HandlerDescriptor {
        self.descriptor.clone()
    }

    async fn execute(
        &self,
        _event: &Event,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::with_data(self.data.clone()))
    }
}
