//! MCP server: the fixed eight-tool catalog.
//!
//! `bash`, `bash_output`, `kill_bash`, `read`, `write`, `edit`, `grep`,
//! `glob` -- nothing else. Each handler is a thin adapter from MCP call
//! parameters onto the corresponding module (`bash`, `files`, `search`),
//! converting an [`crate::error::EngineError`] into the MCP error envelope
//! rather than ever propagating a Rust error out of the handler itself.

use crate::bash;
use crate::error::EngineError;
use crate::files;
use crate::registry::SessionRegistry;
use crate::search::{self, GrepOptions, OutputMode};
use crate::transport::Transport;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BashParams {
    /// The shell command to execute.
    pub command: String,
    /// Advisory only; not used to alter execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Timeout in milliseconds. Defaults to 120000, clamped to 600000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Run the command as a background shell and return its id immediately.
    #[serde(default)]
    pub run_in_background: bool,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BashOutputParams {
    pub shell_id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct KillBashParams {
    pub shell_id: String,
    /// POSIX signal name. Defaults to `SIGTERM`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ReadParams {
    pub file_path: String,
    /// 1-based starting line. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Maximum lines to return. Defaults to 2000, ceiling 2000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct WriteParams {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct EditParams {
    pub file_path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default)]
    pub replace_all: bool,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GrepParams {
    pub pattern: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
    #[serde(default)]
    pub output_mode: Option<OutputMode>,
    #[serde(rename = "-B", skip_serializing_if = "Option::is_none")]
    pub before_context: Option<u32>,
    #[serde(rename = "-A", skip_serializing_if = "Option::is_none")]
    pub after_context: Option<u32>,
    #[serde(rename = "-C", skip_serializing_if = "Option::is_none")]
    pub context: Option<u32>,
    #[serde(rename = "-n", default)]
    pub line_numbers: bool,
    #[serde(rename = "-i", default)]
    pub case_insensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_limit: Option<usize>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GlobParams {
    pub base_path: String,
    pub pattern: String,
    #[serde(default)]
    pub include_hidden: bool,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The agentremote MCP server: a transport, a background-session registry,
/// and the tool router built from the `#[tool]` catalog below.
#[derive(Clone)]
pub struct AgentRemoteServer {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionRegistry>,
    tool_router: ToolRouter<AgentRemoteServer>,
}

impl AgentRemoteServer {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sessions: Arc::new(SessionRegistry::new()),
            tool_router: Self::tool_router(),
        }
    }

    /// Used by the entry point on shutdown to broadcast `SIGTERM` to every
    /// live background session.
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }
}

fn text_result(text: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn error_result(err: EngineError) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(err.to_string())]))
}

#[tool_router]
impl AgentRemoteServer {
    #[tool(
        description = "Run a shell command on the remote host. By default runs to completion and returns combined stdout/stderr plus the exit code (timeout default 120000ms, max 600000ms). Set run_in_background to start a long-lived shell instead: returns {shellId} immediately; poll it with bash_output and stop it with kill_bash."
    )]
    async fn bash(&self, Parameters(params): Parameters<BashParams>) -> Result<CallToolResult, McpError> {
        tracing::info!(command = %params.command, background = params.run_in_background, "bash");

        if params.run_in_background {
            match bash::run_background(
                &self.sessions,
                self.transport.clone(),
                &params.command,
                params.timeout,
            )
            .await
            {
                Ok(shell_id) => json_result(&serde_json::json!({ "shellId": shell_id })),
                Err(e) => error_result(e),
            }
        } else {
            let text = bash::run_foreground(self.transport.as_ref(), &params.command, params.timeout).await;
            text_result(text)
        }
    }

    #[tool(
        description = "Fetch output produced by a background shell since the last bash_output call. Returns {stdout, stderr, truncated, status, exitCode}. Safe to call repeatedly; already-delivered bytes are never repeated."
    )]
    async fn bash_output(
        &self,
        Parameters(params): Parameters<BashOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(shell_id = %params.shell_id, "bash_output");

        match bash::bash_output(&self.sessions, &params.shell_id).await {
            Ok(result) => json_result(&result),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Send a POSIX signal (default SIGTERM) to a background shell. Returns {killed:true} on the first successful signal, {killed:false, reason} if the shell was already terminal."
    )]
    async fn kill_bash(
        &self,
        Parameters(params): Parameters<KillBashParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(shell_id = %params.shell_id, signal = params.signal.as_deref().unwrap_or("SIGTERM"), "kill_bash");

        match bash::kill_bash(&self.sessions, &params.shell_id, params.signal.as_deref()).await {
            Ok(result) => json_result(&result),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Read a file from the remote host as text, windowed by 1-based offset/limit (default offset 1, default and max limit 2000 lines). Output is rendered cat -n style: right-aligned line number, tab, then the line. Refuses files that look binary."
    )]
    async fn read(&self, Parameters(params): Parameters<ReadParams>) -> Result<CallToolResult, McpError> {
        tracing::info!(file_path = %params.file_path, offset = params.offset, limit = params.limit, "read");

        match files::read(self.transport.as_ref(), &params.file_path, params.offset, params.limit).await {
            Ok(text) => text_result(text),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Overwrite a file on the remote host with the given content, creating missing parent directories. Returns a confirmation with the byte length written."
    )]
    async fn write(&self, Parameters(params): Parameters<WriteParams>) -> Result<CallToolResult, McpError> {
        tracing::info!(file_path = %params.file_path, bytes = params.content.len(), "write");

        match files::write(self.transport.as_ref(), &params.file_path, &params.content).await {
            Ok(text) => text_result(text),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Exact literal find-and-replace in a remote file. By default requires old_string to match exactly once; set replace_all to replace every occurrence. old_string and new_string must differ. Returns the replacement count and a few lines of context around the first replacement."
    )]
    async fn edit(&self, Parameters(params): Parameters<EditParams>) -> Result<CallToolResult, McpError> {
        tracing::info!(file_path = %params.file_path, replace_all = params.replace_all, "edit");

        match files::edit(
            self.transport.as_ref(),
            &params.file_path,
            &params.old_string,
            &params.new_string,
            params.replace_all,
        )
        .await
        {
            Ok(result) => json_result(&result),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Search file contents on the remote host, preferring ripgrep and falling back to POSIX grep. output_mode is one of content (default), files_with_matches, count. -B/-A/-C add context lines (content mode only), -n shows line numbers, -i is case-insensitive, head_limit caps output lines. No matches is a successful empty result, not an error."
    )]
    async fn grep(&self, Parameters(params): Parameters<GrepParams>) -> Result<CallToolResult, McpError> {
        tracing::info!(pattern = %params.pattern, path = %params.path, "grep");

        let opts = GrepOptions {
            glob: params.glob,
            output_mode: params.output_mode.unwrap_or_default(),
            before_context: params.before_context,
            after_context: params.after_context,
            context: params.context,
            line_numbers: params.line_numbers,
            case_insensitive: params.case_insensitive,
            head_limit: params.head_limit,
        };
        match search::grep(self.transport.as_ref(), &params.pattern, &params.path, &opts).await {
            Ok(text) => text_result(text),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Find files under base_path whose relative path matches a glob pattern (*, **, ?, character classes), sorted by modification time, newest first. Hidden entries (any path component starting with '.') are excluded unless include_hidden is set. Directories are never returned; results are capped at 1000 entries."
    )]
    async fn glob(&self, Parameters(params): Parameters<GlobParams>) -> Result<CallToolResult, McpError> {
        tracing::info!(base_path = %params.base_path, pattern = %params.pattern, "glob");

        match search::glob(
            self.transport.as_ref(),
            &params.base_path,
            &params.pattern,
            params.include_hidden,
        )
        .await
        {
            Ok(text) => text_result(text),
            Err(e) => error_result(e),
        }
    }
}

#[tool_handler]
impl ServerHandler for AgentRemoteServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "agentremote".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "agentremote drives a remote host on behalf of an agent: bash (foreground or \
                 background shells), bash_output/kill_bash for managing background shells, \
                 read/write/edit for file access, and grep/glob for search. All file paths are \
                 absolute on the remote host."
                    .to_string(),
            ),
        }
    }
}
