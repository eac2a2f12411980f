//! PDB Bridge Core
//!
//! Drives an external, line-oriented Python debugger (`pdb`, or pytest's `--pdb`
//! post-mortem mode) as a child process and exposes it as a synchronous
//! request/response session. Provides environment resolution, process
//! supervision, output bridging, and a shadow copy of the debugger's breakpoints.

pub mod args;
pub mod breakpoints;
pub mod classifier;
pub mod config;
pub mod env;
pub mod error;
pub mod output;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use breakpoints::{BreakpointKey, BreakpointRecord, BreakpointStore, DebuggerChannel};
pub use config::{SessionConfig, ShutdownTimings};
pub use env::{EnvironmentResolver, ExecutionStrategy, HostEnvironment, ResolvedEnvironment};
pub use error::DebugError;
pub use output::OutputBridge;
pub use session::{SessionController, SessionState, SessionStatus};
pub use supervisor::{DebuggeeProcess, ShutdownOutcome};

/// Result type alias using DebugError
pub type Result<T> = std::result::Result<T, DebugError>;
