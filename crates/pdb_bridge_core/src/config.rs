use std::time::Duration;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_LONG_RUNNING_MULTIPLIER: u32 = 3;
const DEFAULT_PROMPT_MARKER: &str = "(Pdb)";

/// Bounded waits used by the shutdown escalation, one per step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownTimings {
    pub after_interrupt: Duration,
    pub after_quit: Duration,
    pub after_terminate: Duration,
    pub after_kill: Duration,
}

impl Default for ShutdownTimings {
    fn default() -> Self {
        Self {
            after_interrupt: Duration::from_millis(500),
            after_quit: Duration::from_millis(500),
            after_terminate: Duration::from_secs(1),
            after_kill: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub response_timeout: Duration,
    pub startup_timeout: Duration,
    pub long_running_multiplier: u32,
    pub prompt_marker: String,
    pub shutdown: ShutdownTimings,
    pub reader_join_timeout: Duration,
    /// How long to wait for the child to exit once its output stream has closed.
    pub exit_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            long_running_multiplier: DEFAULT_LONG_RUNNING_MULTIPLIER,
            prompt_marker: DEFAULT_PROMPT_MARKER.to_string(),
            shutdown: ShutdownTimings::default(),
            reader_join_timeout: Duration::from_secs(1),
            exit_grace: Duration::from_millis(250),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let response_timeout = env_millis("PDB_MCP_RESPONSE_TIMEOUT_MS")
            .unwrap_or(defaults.response_timeout);
        let startup_timeout =
            env_millis("PDB_MCP_STARTUP_TIMEOUT_MS").unwrap_or(defaults.startup_timeout);
        let long_running_multiplier = std::env::var("PDB_MCP_LONG_RUNNING_MULTIPLIER")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|m| *m > 0)
            .unwrap_or(defaults.long_running_multiplier);
        let prompt_marker = std::env::var("PDB_MCP_PROMPT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.prompt_marker);

        Self {
            response_timeout,
            startup_timeout,
            long_running_multiplier,
            prompt_marker,
            ..defaults
        }
    }

    /// Drain budget for a command, scaled for commands that run the debuggee
    /// and by an extra caller-supplied factor (used during slow start-up sequences).
    pub fn budget_for(&self, long_running: bool, extra_multiplier: f64) -> Duration {
        let base = if long_running {
            self.response_timeout * self.long_running_multiplier
        } else {
            self.response_timeout
        };
        if extra_multiplier.is_finite() && extra_multiplier > 0.0 {
            base.mul_f64(extra_multiplier)
        } else {
            base
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
