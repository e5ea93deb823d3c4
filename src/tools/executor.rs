//! Tool executor: name + JSON arguments → envelope

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::exec_code::exec_code;
use super::install::install_package;
use super::{error_envelope, ToolError, ToolInvocation, ToolKind, Workspace};
use crate::execution::ExecutionEngine;

/// Per-conversation state the tools run against
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub workspace: Option<Workspace>,
    pub engine: Arc<ExecutionEngine>,
    /// Interpreter used for installs when the conversation has no kernel yet
    pub interpreter: String,
    pub install_timeout: Duration,
}

#[derive(Clone)]
pub struct ToolExecutor {
    context: ToolContext,
}

impl ToolExecutor {
    pub fn new(context: ToolContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Execute a tool by name
    ///
    /// Unknown names are an error with no side effect. Bad arguments and
    /// failures inside a tool come back as `{"status": "error"}` envelopes.
    pub async fn execute(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let Some(kind) = ToolKind::from_name(name) else {
            warn!(tool = name, "model requested unknown tool");
            return Err(ToolError::UnknownTool(name.to_string()));
        };

        match ToolInvocation::parse(kind, arguments) {
            Ok(invocation) => Ok(self.dispatch(invocation).await),
            Err(e) => {
                debug!(tool = name, error = %e, "rejecting tool arguments");
                Ok(error_envelope(e))
            }
        }
    }

    pub async fn dispatch(&self, invocation: ToolInvocation) -> Value {
        let ctx = &self.context;
        match invocation {
            ToolInvocation::ReadDirectory { path } => match &ctx.workspace {
                Some(ws) => ws.read_directory(path.as_deref()).await,
                None => error_envelope("no workspace selected"),
            },
            ToolInvocation::ReadFiles { filenames } => match &ctx.workspace {
                Some(ws) => ws.read_files(&filenames).await,
                None => error_envelope("no workspace selected"),
            },
            ToolInvocation::ExecCode { code } => {
                exec_code(
                    &ctx.engine,
                    &ctx.conversation_id,
                    ctx.workspace.as_ref(),
                    &code,
                )
                .await
            }
            ToolInvocation::InstallPackage { package_name } => {
                let interpreter = ctx
                    .engine
                    .interpreter_for(&ctx.conversation_id)
                    .await
                    .unwrap_or_else(|| ctx.interpreter.clone());
                install_package(&interpreter, &package_name, ctx.install_timeout).await
            }
        }
    }
}
