use std::sync::Arc;

use pdb_bridge_core::{SessionConfig, SessionController};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct StartDebugParams {
    /// Path to the Python file to debug (or the test file when use_pytest is set)
    file_path: String,
    /// Run the file under pytest with --pdb instead of python -m pdb
    #[serde(default)]
    use_pytest: bool,
    /// Extra arguments for the script or pytest, split with shell quoting rules
    #[serde(default)]
    args: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SendCommandParams {
    /// The pdb command to execute (e.g. 'n', 'c', 'p x')
    command: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BreakpointParams {
    /// Path to the file, absolute or relative to the project root
    file_path: String,
    line_number: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ExamineParams {
    /// Name (or single-line expression) to inspect in the current frame
    variable_name: String,
}

#[derive(Clone)]
struct PdbMcpServer {
    tool_router: ToolRouter<Self>,
    controller: Arc<Mutex<SessionController>>,
}

/// Error text with every `source()` cause appended.
fn describe_error(err: &dyn std::error::Error) -> String {
    let mut message = format!("Error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(&format!("\nCaused by: {cause}"));
        source = cause.source();
    }
    message
}

fn text_result(tool: &str, result: pdb_bridge_core::Result<String>) -> CallToolResult {
    match result {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(e) => {
            tracing::warn!("{tool} failed: {e}");
            CallToolResult::error(vec![Content::text(describe_error(&e))])
        }
    }
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

#[tool_router]
impl PdbMcpServer {
    fn new(config: SessionConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            controller: Arc::new(Mutex::new(SessionController::new(config))),
        }
    }

    #[tool(
        description = "Start a pdb debugging session on a Python file. The interpreter is chosen from the project: uv when a pyproject.toml is present, then an activated virtualenv or conda env, then a project .venv/venv, then python3 on PATH. Set use_pytest to debug failing tests with pytest --pdb. Example: file_path='src/app.py', args='--verbose'"
    )]
    async fn start_debug(
        &self,
        params: Parameters<StartDebugParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut controller = self.controller.lock().await;
        let result = controller
            .start(&params.file_path, params.use_pytest, &params.args)
            .await;
        Ok(text_result("start_debug", result))
    }

    #[tool(
        description = "Send a command to the running pdb session and return its output. Stepping commands also return the code around the current line. Examples: 'n' (next line), 's' (step into), 'c' (continue to the next breakpoint), 'p x' (print x), 'b 42' (breakpoint at line 42 of the current file), 'cl src/code.py:26' (clear a breakpoint), 'w' (stack trace)"
    )]
    async fn send_command(
        &self,
        params: Parameters<SendCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut controller = self.controller.lock().await;
        let result = controller.send(&params.0.command).await;
        Ok(text_result("send_command", result))
    }

    #[tool(
        description = "Set a breakpoint at a line in a file. Breakpoints are remembered and restored when the session is restarted."
    )]
    async fn set_breakpoint(
        &self,
        params: Parameters<BreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut controller = self.controller.lock().await;
        let result = controller
            .set_breakpoint(&params.file_path, params.line_number)
            .await;
        Ok(text_result("set_breakpoint", result))
    }

    #[tool(description = "Clear the breakpoint at a line in a file")]
    async fn clear_breakpoint(
        &self,
        params: Parameters<BreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut controller = self.controller.lock().await;
        let result = controller
            .clear_breakpoint(&params.file_path, params.line_number)
            .await;
        Ok(text_result("clear_breakpoint", result))
    }

    #[tool(
        description = "List breakpoints as pdb reports them, next to the breakpoints tracked for restarts"
    )]
    async fn list_breakpoints(&self) -> Result<CallToolResult, McpError> {
        let mut controller = self.controller.lock().await;
        let result = controller.list_breakpoints().await;
        Ok(text_result("list_breakpoints", result))
    }

    #[tool(
        description = "Restart the debugging session with the same file, pytest flag and arguments, restoring tracked breakpoints"
    )]
    async fn restart_debug(&self) -> Result<CallToolResult, McpError> {
        let mut controller = self.controller.lock().await;
        let result = controller.restart().await;
        Ok(text_result("restart_debug", result))
    }

    #[tool(description = "End the current debugging session and stop the debugger process")]
    async fn end_debug(&self) -> Result<CallToolResult, McpError> {
        let mut controller = self.controller.lock().await;
        let result = controller.end().await;
        Ok(text_result("end_debug", result))
    }

    #[tool(
        description = "Get the session state, target file, project root, interpreter strategy, launch command and tracked breakpoints"
    )]
    async fn get_status(&self) -> Result<CallToolResult, McpError> {
        let mut controller = self.controller.lock().await;
        let status = controller.status().await;
        let value = serde_json::to_value(&status)
            .map_err(|e| to_mcp_error(format!("Failed to encode session status: {e}")))?;
        Ok(CallToolResult::structured(value))
    }

    #[tool(
        description = "Examine a variable: prints its value, type, attributes (dir) and pretty-printed form. Example: variable_name='request.headers'"
    )]
    async fn examine(&self, params: Parameters<ExamineParams>) -> Result<CallToolResult, McpError> {
        let mut controller = self.controller.lock().await;
        let result = controller.examine(&params.0.variable_name).await;
        Ok(text_result("examine", result))
    }
}

#[tool_handler]
impl ServerHandler for PdbMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Python debugger (pdb) MCP Server. Call start_debug first, then drive the session with send_command and the breakpoint tools; end_debug stops it.".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP transport; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let server = PdbMcpServer::new(SessionConfig::from_env());
    let controller = server.controller.clone();
    let transport = transport::stdio();

    tracing::info!("Starting PDB MCP Server on stdio...");

    let served: Result<(), Box<dyn std::error::Error>> = match server.serve(transport).await {
        Ok(service) => service.waiting().await.map(|_| ()).map_err(Into::into),
        Err(e) => Err(e.into()),
    };

    match controller.lock().await.end().await {
        Ok(message) => tracing::info!("Shutdown: {message}"),
        Err(e) => tracing::warn!("Shutdown cleanup failed: {e}"),
    }

    served
}
