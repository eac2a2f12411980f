//! The debugging session state machine and the command/response surface
//! exposed to callers.
//!
//! `SessionController` is not internally synchronized: callers hold it behind
//! a mutex so only one operation (and one in-flight command) runs at a time.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::args::sanitize_args;
use crate::breakpoints::{BreakpointStore, DebuggerChannel};
use crate::classifier::{
    classify_startup, command_class, fast_tool_rejected_project, is_navigation_command,
    CommandClass, StartupVerdict,
};
use crate::config::SessionConfig;
use crate::env::{EnvironmentResolver, ExecutionStrategy, ResolvedEnvironment};
use crate::output::OutputBridge;
use crate::supervisor::{platform_signals, DebuggeeProcess, ProcessSignals, ShutdownOutcome};
use crate::{DebugError, Result};

const LOCATION_COMMAND: &str = "l .";
const SESSION_ENDED: &str = "The debugging session has ended.";
/// Budget scale for breakpoint replay when the child was slow to show a prompt.
const SLOW_START_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Ended,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub target_file: Option<String>,
    pub project_root: Option<String>,
    pub strategy: Option<&'static str>,
    pub launch_command: Vec<String>,
    pub use_pytest: bool,
    pub args: Vec<String>,
    pub process_id: Option<u32>,
    pub breakpoints: Vec<String>,
}

#[derive(Debug, Clone)]
struct LaunchRequest {
    file_path: String,
    use_pytest: bool,
    args: String,
}

struct ActiveProcess {
    process: DebuggeeProcess,
    bridge: OutputBridge,
}

impl ActiveProcess {
    async fn exchange(
        &mut self,
        command: &str,
        config: &SessionConfig,
        extra_multiplier: f64,
    ) -> Result<String> {
        self.process.write_line(command).await?;
        let long_running = command_class(command) == CommandClass::LongRunning;
        let budget = config.budget_for(long_running, extra_multiplier);
        Ok(self.bridge.drain(budget).await)
    }

    /// Liveness after a drain. A closed output stream means the child is
    /// exiting, so give it a moment to be reaped before deciding.
    async fn still_alive(&mut self, config: &SessionConfig) -> bool {
        if self.bridge.is_closed() {
            !self.process.wait_for_exit(config.exit_grace).await
        } else {
            self.process.is_alive()
        }
    }
}

struct LiveChannel<'a> {
    active: &'a mut ActiveProcess,
    config: &'a SessionConfig,
    extra_multiplier: f64,
}

impl DebuggerChannel for LiveChannel<'_> {
    async fn exchange(&mut self, command: &str) -> Result<String> {
        self.active
            .exchange(command, self.config, self.extra_multiplier)
            .await
    }
}

pub struct SessionController {
    config: SessionConfig,
    resolver: EnvironmentResolver,
    signals: Box<dyn ProcessSignals>,
    state: SessionState,
    active: Option<ActiveProcess>,
    environment: Option<ResolvedEnvironment>,
    invocation_args: Vec<String>,
    last_request: Option<LaunchRequest>,
    breakpoints: BreakpointStore,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_resolver(config, EnvironmentResolver::from_process())
    }

    pub fn with_resolver(config: SessionConfig, resolver: EnvironmentResolver) -> Self {
        Self {
            config,
            resolver,
            signals: platform_signals(),
            state: SessionState::Idle,
            active: None,
            environment: None,
            invocation_args: Vec::new(),
            last_request: None,
            breakpoints: BreakpointStore::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn breakpoints(&self) -> &BreakpointStore {
        &self.breakpoints
    }

    pub fn environment(&self) -> Option<&ResolvedEnvironment> {
        self.environment.as_ref()
    }

    pub async fn start(&mut self, file_path: &str, use_pytest: bool, args: &str) -> Result<String> {
        self.recover_stale_state().await;
        if matches!(self.state, SessionState::Starting | SessionState::Running) {
            return Err(DebugError::AlreadyRunning);
        }

        let extra_args = sanitize_args(args)?;
        self.state = SessionState::Starting;
        match self.launch(file_path, use_pytest, extra_args).await {
            Ok(text) => {
                self.last_request = Some(LaunchRequest {
                    file_path: file_path.to_string(),
                    use_pytest,
                    args: args.to_string(),
                });
                Ok(text)
            }
            Err(e) => {
                warn!("Failed to start debugging {file_path}: {e}");
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    async fn launch(
        &mut self,
        file_path: &str,
        use_pytest: bool,
        extra_args: Vec<String>,
    ) -> Result<String> {
        let env = self.resolver.resolve(file_path, use_pytest, &extra_args)?;
        let mut process = DebuggeeProcess::launch(&env)?;
        let output = process
            .take_output()
            .ok_or_else(|| DebugError::launch_failed("debugger output stream unavailable"))?;
        let mut active = ActiveProcess {
            process,
            bridge: OutputBridge::spawn(output, self.config.prompt_marker.clone()),
        };
        self.state = SessionState::Running;

        let startup = active.bridge.drain(self.config.startup_timeout).await;
        let alive = active.still_alive(&self.config).await;
        let (warning, replay_multiplier) =
            match classify_startup(&startup, alive, &self.config.prompt_marker) {
                StartupVerdict::Ready => (None, 1.0),
                StartupVerdict::SlowStart { warning } => {
                    warn!("{warning}");
                    (Some(warning), SLOW_START_MULTIPLIER)
                }
                StartupVerdict::Failed { reason } => {
                    if matches!(env.strategy, ExecutionStrategy::FastTool { .. })
                        && fast_tool_rejected_project(&startup)
                    {
                        self.resolver.reject_fast_tool(&env.project_root);
                    }
                    self.teardown(active).await;
                    return Err(DebugError::startup_failed(format!("{reason}\n{startup}")));
                }
            };

        let mut text = String::new();
        if let Some(warning) = warning {
            text.push_str(&warning);
            text.push_str("\n\n");
        }
        text.push_str(&format!(
            "Debugging session started for {} (using {} in {})\n\n{startup}",
            env.target_file.display(),
            env.strategy.name(),
            env.project_root.display(),
        ));

        let replayed = {
            let mut channel = LiveChannel {
                active: &mut active,
                config: &self.config,
                extra_multiplier: replay_multiplier,
            };
            self.breakpoints
                .replay_all(&mut channel, &env.target_file)
                .await
        };
        match replayed {
            Ok(summary) if !summary.is_empty() => {
                text.push_str("\n\nRestored breakpoints:\n");
                text.push_str(&summary.join("\n"));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Breakpoint replay failed: {e}");
                text.push_str(&format!("\n\nWarning: could not restore breakpoints: {e}"));
            }
        }

        info!("Debugging session running for {}", env.target_file.display());
        self.invocation_args = extra_args;
        self.environment = Some(env);
        self.active = Some(active);
        Ok(text)
    }

    pub async fn send(&mut self, command: &str) -> Result<String> {
        if let Some(notice) = self.check_running().await? {
            return Ok(notice);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(DebugError::NotRunning);
        };

        let response = match active.exchange(command, &self.config, 1.0).await {
            Ok(response) => response,
            Err(DebugError::BrokenPipe) => return Ok(self.end_of_session(None).await),
            Err(e) => return Err(e),
        };
        if !active.still_alive(&self.config).await {
            return Ok(self.end_of_session(Some(response)).await);
        }

        let mut text = format!("Command output:\n{response}");
        if is_navigation_command(command) {
            match active.exchange(LOCATION_COMMAND, &self.config, 1.0).await {
                Ok(context) => {
                    text.push_str("\n\nCurrent line context:\n");
                    text.push_str(&context);
                }
                Err(DebugError::BrokenPipe) => {
                    return Ok(self.end_of_session(Some(response)).await);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(text)
    }

    pub async fn set_breakpoint(&mut self, file_path: &str, line: u32) -> Result<String> {
        if let Some(notice) = self.check_running().await? {
            return Ok(notice);
        }
        let (Some(active), Some(env)) = (self.active.as_mut(), self.environment.as_ref()) else {
            return Err(DebugError::NotRunning);
        };
        let mut channel = LiveChannel {
            active,
            config: &self.config,
            extra_multiplier: 1.0,
        };
        let result = self
            .breakpoints
            .set(&mut channel, &env.project_root, file_path, line)
            .await;
        self.after_exchange(result).await
    }

    pub async fn clear_breakpoint(&mut self, file_path: &str, line: u32) -> Result<String> {
        if let Some(notice) = self.check_running().await? {
            return Ok(notice);
        }
        let (Some(active), Some(env)) = (self.active.as_mut(), self.environment.as_ref()) else {
            return Err(DebugError::NotRunning);
        };
        let mut channel = LiveChannel {
            active,
            config: &self.config,
            extra_multiplier: 1.0,
        };
        let result = self
            .breakpoints
            .clear(&mut channel, &env.project_root, file_path, line)
            .await;
        self.after_exchange(result).await
    }

    pub async fn list_breakpoints(&mut self) -> Result<String> {
        if let Some(notice) = self.check_running().await? {
            return Ok(notice);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(DebugError::NotRunning);
        };
        let mut channel = LiveChannel {
            active,
            config: &self.config,
            extra_multiplier: 1.0,
        };
        let result = self.breakpoints.list(&mut channel).await;
        self.after_exchange(result).await
    }

    /// Value, type, attributes, and pretty-printed value of a variable.
    pub async fn examine(&mut self, variable: &str) -> Result<String> {
        let variable = variable.trim();
        if variable.is_empty() || variable.contains(['\n', '\r']) {
            return Err(DebugError::InvalidArgument(
                "variable name must be a single non-empty line".to_string(),
            ));
        }
        if let Some(notice) = self.check_running().await? {
            return Ok(notice);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(DebugError::NotRunning);
        };

        let probes = [
            ("Value", format!("p {variable}")),
            ("Type", format!("p type({variable})")),
            ("Properties/Methods", format!("p dir({variable})")),
            ("Formatted", format!("pp {variable}")),
        ];
        let mut sections = Vec::with_capacity(probes.len());
        for (label, command) in probes {
            match active.exchange(&command, &self.config, 1.0).await {
                Ok(response) => sections.push(format!("{label}:\n{response}")),
                Err(DebugError::BrokenPipe) => {
                    let partial = sections.join("\n\n");
                    return Ok(self.end_of_session(Some(partial)).await);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(format!("Variable examination of {variable}:\n\n{}", sections.join("\n\n")))
    }

    /// Stops the child (escalating as needed) and returns to `Idle`. Safe to
    /// call repeatedly.
    pub async fn end(&mut self) -> Result<String> {
        let Some(active) = self.active.take() else {
            if self.state != SessionState::Ended {
                self.state = SessionState::Idle;
            }
            let message = if self.last_request.is_some() {
                "The debugging session has already ended."
            } else {
                "No active debugging session."
            };
            return Ok(message.to_string());
        };

        let outcome = self.teardown(active).await;
        self.state = SessionState::Idle;
        let detail = match outcome {
            ShutdownOutcome::AlreadyExited => "process had already exited",
            ShutdownOutcome::Interrupted => "stopped by interrupt",
            ShutdownOutcome::Quit => "stopped by quit command",
            ShutdownOutcome::Terminated => "terminated",
            ShutdownOutcome::Killed => "killed",
            ShutdownOutcome::Unresponsive => "process did not respond to kill",
        };
        Ok(format!("Debugging session ended ({detail})."))
    }

    /// Ends the session and starts it again with the last file, flags, and
    /// arguments; tracked breakpoints for that file are replayed by `start`.
    pub async fn restart(&mut self) -> Result<String> {
        let Some(request) = self.last_request.clone() else {
            return Err(DebugError::NotRunning);
        };
        self.end().await?;
        let started = self
            .start(&request.file_path, request.use_pytest, &request.args)
            .await?;
        Ok(format!("Debugging session restarted:\n{started}"))
    }

    pub async fn status(&mut self) -> SessionStatus {
        if self.state == SessionState::Running {
            let alive = self
                .active
                .as_mut()
                .map(|active| active.process.is_alive())
                .unwrap_or(false);
            if !alive {
                self.end_of_session(None).await;
            }
        }

        let env = self.environment.as_ref();
        SessionStatus {
            state: self.state,
            target_file: env.map(|e| e.target_file.display().to_string()),
            project_root: env.map(|e| e.project_root.display().to_string()),
            strategy: env.map(|e| e.strategy.name()),
            launch_command: env.map(|e| e.launch_command.clone()).unwrap_or_default(),
            use_pytest: self.last_request.as_ref().is_some_and(|r| r.use_pytest),
            args: self.invocation_args.clone(),
            process_id: self.active.as_ref().and_then(|a| a.process.pid()),
            breakpoints: self.breakpoints.tracked(),
        }
    }

    /// `NotRunning` unless Running; an end-of-session notice when the child
    /// turns out to be dead.
    async fn check_running(&mut self) -> Result<Option<String>> {
        if self.state != SessionState::Running {
            return Err(DebugError::NotRunning);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(DebugError::NotRunning);
        };
        if active.process.is_alive() {
            Ok(None)
        } else {
            Ok(Some(self.end_of_session(None).await))
        }
    }

    async fn after_exchange(&mut self, result: Result<String>) -> Result<String> {
        match result {
            Err(DebugError::BrokenPipe) => Ok(self.end_of_session(None).await),
            Ok(text) => {
                let alive = self
                    .active
                    .as_mut()
                    .map(|active| active.process.is_alive())
                    .unwrap_or(false);
                if alive {
                    Ok(text)
                } else {
                    Ok(self.end_of_session(Some(text)).await)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn end_of_session(&mut self, response: Option<String>) -> String {
        if let Some(active) = self.active.take() {
            self.teardown(active).await;
        }
        self.state = SessionState::Ended;
        info!("Debugging session ended (debugger process exited)");
        match response {
            Some(response) => format!("Command output:\n{response}\n\n{SESSION_ENDED}"),
            None => format!("{SESSION_ENDED} Use start_debug to start a new session."),
        }
    }

    async fn recover_stale_state(&mut self) {
        if !matches!(self.state, SessionState::Starting | SessionState::Running) {
            return;
        }
        let alive = self
            .active
            .as_mut()
            .map(|active| active.process.is_alive())
            .unwrap_or(false);
        if alive {
            return;
        }
        warn!("Recovered stale session state: debugger process had already exited");
        if let Some(active) = self.active.take() {
            self.teardown(active).await;
        }
        self.state = SessionState::Idle;
    }

    async fn teardown(&self, mut active: ActiveProcess) -> ShutdownOutcome {
        let outcome = active
            .process
            .shutdown(&self.config.shutdown, self.signals.as_ref())
            .await;
        active.bridge.join(self.config.reader_join_timeout).await;
        let discarded = active.bridge.discard_pending();
        if discarded > 0 {
            debug!("Discarded {discarded} residual output lines");
        }
        outcome
    }
}
