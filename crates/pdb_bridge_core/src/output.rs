//! Background reader for the debugger's merged output and the bounded-wait
//! drain that turns the line stream into discrete responses.

use std::io::Read;
use std::time::{Duration, Instant};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::classifier::ends_with_prompt;

const READ_CHUNK: usize = 4096;

pub struct OutputBridge {
    lines: UnboundedReceiver<String>,
    reader: Option<JoinHandle<()>>,
    prompt_marker: String,
    stream_closed: bool,
}

impl OutputBridge {
    /// Starts the reader. It is the only reader of `stream` and exits at
    /// end-of-stream or on the first read error, dropping the stream.
    pub fn spawn<R>(stream: R, prompt_marker: impl Into<String>) -> Self
    where
        R: Read + Send + 'static,
    {
        let prompt_marker = prompt_marker.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let marker = prompt_marker.clone();
        let reader = tokio::task::spawn_blocking(move || read_lines(stream, tx, &marker));

        Self {
            lines: rx,
            reader: Some(reader),
            prompt_marker,
            stream_closed: false,
        }
    }

    /// Collects lines until `budget` runs out, a line ends with the idle
    /// prompt, or the stream is closed and fully consumed.
    pub async fn drain(&mut self, budget: Duration) -> String {
        let started = Instant::now();
        let mut collected: Vec<String> = Vec::new();

        loop {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.lines.recv()).await {
                Ok(Some(line)) => {
                    let at_prompt = ends_with_prompt(&line, &self.prompt_marker);
                    collected.push(line);
                    if at_prompt {
                        break;
                    }
                }
                Ok(None) => {
                    self.stream_closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        collected.join("\n")
    }

    /// True once a drain has observed that the reader exited and the queue is empty.
    pub fn is_closed(&self) -> bool {
        self.stream_closed
    }

    /// Waits up to `wait` for the reader to finish; returns whether it did.
    pub async fn join(&mut self, wait: Duration) -> bool {
        let Some(handle) = self.reader.take() else {
            return true;
        };
        match timeout(wait, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Output reader task failed: {e}");
                true
            }
            Err(_) => {
                warn!("Output reader still blocked after {wait:?}; detaching it");
                false
            }
        }
    }

    /// Drops whatever is still queued; returns how many lines were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.lines.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

fn read_lines<R: Read>(mut stream: R, tx: UnboundedSender<String>, prompt_marker: &str) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0_u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Debugger output stream error: {e}");
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=newline).collect();
            if tx.send(decode_line(&line)).is_err() {
                return;
            }
        }

        // The prompt is printed without a newline; emit it as its own line.
        if !pending.is_empty() && ends_with_prompt(&String::from_utf8_lossy(&pending), prompt_marker)
        {
            if tx.send(decode_line(&pending)).is_err() {
                return;
            }
            pending.clear();
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(decode_line(&pending));
    }
    debug!("Debugger output stream closed");
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const PROMPT: &str = "(Pdb)";

    fn cursor(text: &str) -> Cursor<Vec<u8>> {
        Cursor::new(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn drain_stops_after_each_prompt() {
        let mut bridge = OutputBridge::spawn(cursor("a\r\n(Pdb) \nb\n(Pdb) "), PROMPT);

        let started = Instant::now();
        assert_eq!(bridge.drain(Duration::from_secs(5)).await, "a\n(Pdb) ");
        assert_eq!(bridge.drain(Duration::from_secs(5)).await, "b\n(Pdb) ");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unterminated_prompt_is_delivered_while_stream_stays_open() {
        let (reader, mut writer) = std::io::pipe().expect("pipe");
        let mut bridge = OutputBridge::spawn(reader, PROMPT);

        writer
            .write_all(b"> /proj/a.py(1)<module>()\n-> x = 1\n(Pdb) ")
            .expect("write to pipe");

        let started = Instant::now();
        let response = bridge.drain(Duration::from_secs(5)).await;
        assert_eq!(response, "> /proj/a.py(1)<module>()\n-> x = 1\n(Pdb) ");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!bridge.is_closed());

        drop(writer);
        assert!(bridge.join(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn drain_returns_within_budget_when_child_is_silent() {
        let (reader, writer) = std::io::pipe().expect("pipe");
        let mut bridge = OutputBridge::spawn(reader, PROMPT);

        let budget = Duration::from_millis(200);
        let started = Instant::now();
        let response = bridge.drain(budget).await;
        let elapsed = started.elapsed();

        assert_eq!(response, "");
        assert!(elapsed >= Duration::from_millis(150), "returned early: {elapsed:?}");
        assert!(elapsed < budget + Duration::from_millis(500), "overran: {elapsed:?}");

        drop(writer);
    }

    #[tokio::test]
    async fn closed_stream_flushes_partial_line_and_short_circuits() {
        let mut bridge = OutputBridge::spawn(cursor("first\ntail without newline"), PROMPT);

        let response = bridge.drain(Duration::from_secs(5)).await;
        assert_eq!(response, "first\ntail without newline");
        assert!(bridge.is_closed());

        let started = Instant::now();
        assert_eq!(bridge.drain(Duration::from_secs(5)).await, "");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(bridge.join(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn discard_pending_empties_the_queue() {
        let mut bridge = OutputBridge::spawn(cursor("one\ntwo\nthree\n"), PROMPT);
        assert!(bridge.join(Duration::from_secs(2)).await);

        assert_eq!(bridge.discard_pending(), 3);
        assert_eq!(bridge.discard_pending(), 0);
    }
}
