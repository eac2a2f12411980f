use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("No Python interpreter found (checked uv, active environment, project virtualenvs, and PATH)")]
    NoInterpreterFound,

    #[error("Failed to launch debugger: {reason}")]
    LaunchFailed { reason: String },

    #[error("A debugging session is already running. Use restart_debug to restart it.")]
    AlreadyRunning,

    #[error("No active debugging session. Use start_debug first.")]
    NotRunning,

    #[error("Debugger input stream is closed (process already exited)")]
    BrokenPipe,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Error starting pdb: {output}")]
    StartupFailed { output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebugError {
    pub fn launch_failed(reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            reason: reason.into(),
        }
    }

    pub fn startup_failed(output: impl Into<String>) -> Self {
        Self::StartupFailed {
            output: output.into(),
        }
    }
}
