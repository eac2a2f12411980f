//! Child process lifecycle: launch with merged output, line writes to stdin,
//! liveness checks, and the escalating shutdown sequence.

use std::io::PipeReader;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, Command},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::config::ShutdownTimings;
use crate::env::ResolvedEnvironment;
use crate::{DebugError, Result};

const QUIT_COMMAND: &str = "q";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDelivery {
    Sent,
    Unsupported,
}

/// Signals used by the shutdown escalation. Platforms without an equivalent
/// report `Unsupported` and the step is skipped.
pub trait ProcessSignals: Send + Sync {
    fn interrupt(&self, pid: u32) -> std::io::Result<SignalDelivery>;
    fn terminate(&self, pid: u32) -> std::io::Result<SignalDelivery>;
}

#[cfg(unix)]
pub struct UnixSignals;

#[cfg(unix)]
impl UnixSignals {
    fn send(pid: u32, signal: nix::sys::signal::Signal) -> std::io::Result<SignalDelivery> {
        use nix::unistd::Pid;

        let pid = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        nix::sys::signal::kill(Pid::from_raw(pid), signal)?;
        Ok(SignalDelivery::Sent)
    }
}

#[cfg(unix)]
impl ProcessSignals for UnixSignals {
    fn interrupt(&self, pid: u32) -> std::io::Result<SignalDelivery> {
        Self::send(pid, nix::sys::signal::Signal::SIGINT)
    }

    fn terminate(&self, pid: u32) -> std::io::Result<SignalDelivery> {
        Self::send(pid, nix::sys::signal::Signal::SIGTERM)
    }
}

/// No interrupt or terminate equivalent; shutdown relies on quit and kill.
pub struct NoSignals;

impl ProcessSignals for NoSignals {
    fn interrupt(&self, _pid: u32) -> std::io::Result<SignalDelivery> {
        Ok(SignalDelivery::Unsupported)
    }

    fn terminate(&self, _pid: u32) -> std::io::Result<SignalDelivery> {
        Ok(SignalDelivery::Unsupported)
    }
}

pub fn platform_signals() -> Box<dyn ProcessSignals> {
    #[cfg(unix)]
    {
        Box::new(UnixSignals)
    }
    #[cfg(not(unix))]
    {
        Box::new(NoSignals)
    }
}

/// Which shutdown step ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    AlreadyExited,
    Interrupted,
    Quit,
    Terminated,
    Killed,
    Unresponsive,
}

pub struct DebuggeeProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Option<PipeReader>,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
}

impl DebuggeeProcess {
    /// Spawns the resolved command with stdin piped and stdout/stderr sharing a
    /// single pipe so their interleaving is preserved.
    pub fn launch(env: &ResolvedEnvironment) -> Result<Self> {
        let (program, args) = env
            .launch_command
            .split_first()
            .ok_or_else(|| DebugError::launch_failed("empty launch command"))?;

        let (reader, writer) = std::io::pipe()
            .map_err(|e| DebugError::launch_failed(format!("failed to create output pipe: {e}")))?;
        let stderr_writer = writer
            .try_clone()
            .map_err(|e| DebugError::launch_failed(format!("failed to clone output pipe: {e}")))?;

        let mut child = {
            // The command owns the parent's copies of the pipe's write end;
            // it must be dropped after spawning so the reader sees end-of-stream.
            let mut command = Command::new(program);
            command
                .args(args)
                .current_dir(&env.working_directory)
                .env_clear()
                .envs(&env.environment_variables)
                .stdin(Stdio::piped())
                .stdout(writer)
                .stderr(stderr_writer)
                .kill_on_drop(true);
            command
                .spawn()
                .map_err(|e| DebugError::launch_failed(format!("failed to spawn '{program}': {e}")))?
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DebugError::launch_failed("missing stdin pipe for debugger process"))?;
        let pid = child.id();
        info!("Launched debugger process pid={:?}: {:?}", pid, env.launch_command);

        Ok(Self {
            child,
            stdin: Some(stdin),
            output: Some(reader),
            pid,
            exit_status: None,
        })
    }

    /// Hands out the merged output stream; only the first call returns it.
    pub fn take_output(&mut self) -> Option<PipeReader> {
        self.output.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(DebugError::BrokenPipe)?;
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("Write to debugger stdin failed: {e}");
            self.stdin = None;
            return Err(DebugError::BrokenPipe);
        }
        Ok(())
    }

    /// Non-blocking exit check.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll debugger process: {e}");
                false
            }
        }
    }

    /// Waits up to `wait` for the process to exit; returns whether it did.
    pub async fn wait_for_exit(&mut self, wait: Duration) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match timeout(wait, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(Err(e)) => {
                warn!("Failed waiting for debugger process: {e}");
                false
            }
            Err(_) => false,
        }
    }

    pub async fn shutdown(
        &mut self,
        timings: &ShutdownTimings,
        signals: &dyn ProcessSignals,
    ) -> ShutdownOutcome {
        if !self.is_alive() {
            return ShutdownOutcome::AlreadyExited;
        }

        if let Some(pid) = self.pid {
            match signals.interrupt(pid) {
                Ok(SignalDelivery::Sent) => {
                    if self.wait_for_exit(timings.after_interrupt).await {
                        return self.finished(ShutdownOutcome::Interrupted);
                    }
                }
                Ok(SignalDelivery::Unsupported) => debug!("Interrupt unsupported; skipping"),
                Err(e) => debug!("Interrupt failed: {e}"),
            }
        }

        if !self.is_alive() {
            return self.finished(ShutdownOutcome::Interrupted);
        }
        if let Err(e) = self.write_line(QUIT_COMMAND).await {
            debug!("Quit command not delivered: {e}");
        }
        // Closing stdin is an end-of-file, which pdb also treats as quit.
        self.stdin = None;
        if self.wait_for_exit(timings.after_quit).await {
            return self.finished(ShutdownOutcome::Quit);
        }

        if let Some(pid) = self.pid {
            match signals.terminate(pid) {
                Ok(SignalDelivery::Sent) => {
                    if self.wait_for_exit(timings.after_terminate).await {
                        return self.finished(ShutdownOutcome::Terminated);
                    }
                }
                Ok(SignalDelivery::Unsupported) => debug!("Terminate unsupported; skipping"),
                Err(e) => debug!("Terminate failed: {e}"),
            }
        }

        if !self.is_alive() {
            return self.finished(ShutdownOutcome::Terminated);
        }
        if let Err(e) = self.child.start_kill() {
            warn!("Kill failed: {e}");
        }
        if self.wait_for_exit(timings.after_kill).await {
            self.finished(ShutdownOutcome::Killed)
        } else {
            warn!("Debugger process pid={:?} did not exit after kill", self.pid);
            ShutdownOutcome::Unresponsive
        }
    }

    fn finished(&self, outcome: ShutdownOutcome) -> ShutdownOutcome {
        info!(
            "Debugger process pid={:?} stopped ({outcome:?}, status {:?})",
            self.pid, self.exit_status
        );
        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::env::ExecutionStrategy;
    use std::collections::HashMap;
    use std::io::Read;
    use std::path::PathBuf;

    fn quick_timings() -> ShutdownTimings {
        ShutdownTimings {
            after_interrupt: Duration::from_millis(200),
            after_quit: Duration::from_millis(200),
            after_terminate: Duration::from_millis(200),
            after_kill: Duration::from_secs(2),
        }
    }

    fn shell(script: &str) -> ResolvedEnvironment {
        let mut vars = HashMap::new();
        vars.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        ResolvedEnvironment {
            project_root: PathBuf::from("/"),
            target_file: PathBuf::from("/dev/null"),
            launch_command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            working_directory: std::env::temp_dir(),
            environment_variables: vars,
            strategy: ExecutionStrategy::System {
                interpreter: PathBuf::from("/bin/sh"),
            },
        }
    }

    #[tokio::test]
    async fn launch_merges_stderr_into_output_stream() {
        let mut process = DebuggeeProcess::launch(&shell("echo out; echo err 1>&2; echo done"))
            .expect("shell should launch");
        let mut reader = process.take_output().expect("output available once");
        assert!(process.take_output().is_none());

        let text = tokio::task::spawn_blocking(move || {
            let mut text = String::new();
            reader.read_to_string(&mut text).map(|_| text)
        })
        .await
        .expect("reader task joins")
        .expect("read merged output");

        assert_eq!(text, "out\nerr\ndone\n");
        assert!(process.wait_for_exit(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn launch_reports_missing_executable() {
        let mut env = shell("");
        env.launch_command = vec!["/nonexistent/python-for-tests".to_string()];
        let err = DebuggeeProcess::launch(&env)
            .err()
            .expect("missing executable must fail");
        assert!(matches!(err, DebugError::LaunchFailed { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn write_after_exit_is_broken_pipe() {
        let mut process = DebuggeeProcess::launch(&shell("exit 0")).expect("shell should launch");
        assert!(process.wait_for_exit(Duration::from_secs(2)).await);
        assert!(!process.is_alive());

        let err = process.write_line("p x").await.expect_err("write must fail");
        assert!(matches!(err, DebugError::BrokenPipe), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn shutdown_stops_at_interrupt_for_default_handlers() {
        let mut process = DebuggeeProcess::launch(&shell("exec sleep 30")).expect("launch");
        let outcome = process.shutdown(&quick_timings(), &UnixSignals).await;
        assert_eq!(outcome, ShutdownOutcome::Interrupted);
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn shutdown_uses_quit_command_when_interrupt_is_ignored() {
        let mut process =
            DebuggeeProcess::launch(&shell("trap '' INT; read line; exit 0")).expect("launch");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = process.shutdown(&quick_timings(), &UnixSignals).await;
        assert_eq!(outcome, ShutdownOutcome::Quit);
    }

    #[tokio::test]
    async fn shutdown_escalates_to_kill() {
        let mut process = DebuggeeProcess::launch(&shell(
            "trap '' INT TERM; exec 0</dev/null; while :; do sleep 1; done",
        ))
        .expect("launch");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = process.shutdown(&quick_timings(), &UnixSignals).await;
        assert_eq!(outcome, ShutdownOutcome::Killed);
    }

    #[tokio::test]
    async fn shutdown_without_signals_skips_to_quit_and_kill() {
        let mut process = DebuggeeProcess::launch(&shell("exec sleep 30")).expect("launch");
        let outcome = process.shutdown(&quick_timings(), &NoSignals).await;
        assert_eq!(outcome, ShutdownOutcome::Killed);
    }

    #[tokio::test]
    async fn shutdown_of_exited_process_is_noop() {
        let mut process = DebuggeeProcess::launch(&shell("exit 3")).expect("launch");
        assert!(process.wait_for_exit(Duration::from_secs(2)).await);
        let outcome = process.shutdown(&quick_timings(), &UnixSignals).await;
        assert_eq!(outcome, ShutdownOutcome::AlreadyExited);
        assert_eq!(process.exit_status().and_then(|s| s.code()), Some(3));
    }
}
