use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use llm_proxy_error::GatewayError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Upper bound for one stdout line. Bytes past it are discarded while reading
/// and the whole line is skipped.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const STDERR_HEAD_LINES: usize = 20;
const STDERR_TAIL_LINES: usize = 50;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

pub type LineStream = LineReader<ChildStdout>;

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn display(&self) -> String {
        let mut parts = vec![shell_quote(&self.program.to_string_lossy())];
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct StderrCapture {
    total_lines: usize,
    head: Vec<String>,
    tail: VecDeque<String>,
}

impl StderrCapture {
    fn record(&mut self, line: String) {
        self.total_lines = self.total_lines.saturating_add(1);
        if self.head.len() < STDERR_HEAD_LINES {
            self.head.push(line);
            return;
        }
        self.tail.push_back(line);
        while self.tail.len() > STDERR_TAIL_LINES {
            self.tail.pop_front();
        }
    }

    fn snapshot(&self) -> String {
        let mut lines = self.head.clone();
        let kept = self.head.len() + self.tail.len();
        if self.total_lines > kept {
            lines.push(format!("... ({} lines omitted) ...", self.total_lines - kept));
        }
        lines.extend(self.tail.iter().cloned());
        lines.join("\n").trim().to_string()
    }
}

/// One backend subprocess with piped stdio.
#[derive(Debug)]
pub struct ProcessTransport {
    name: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Arc<Mutex<StderrCapture>>,
    stderr_task: Option<JoinHandle<()>>,
    spawned_at: Instant,
}

impl ProcessTransport {
    /// Spawns `launch`. Without `keep_stdin` the child's stdin is `/dev/null`.
    pub fn spawn(
        name: &'static str,
        launch: &LaunchSpec,
        keep_stdin: bool,
    ) -> Result<Self, GatewayError> {
        let spawned_at = Instant::now();

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(if keep_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            backend = name,
            program = ?launch.program,
            args = launch.args.len(),
            "spawning backend process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                backend = name,
                program = ?launch.program,
                error = %err,
                "failed to spawn backend process"
            );
            GatewayError::transport(format!(
                "failed to spawn `{}`: {err}",
                launch.display()
            ))
        })?;

        tracing::info!(
            backend = name,
            pid = child.id().unwrap_or(0),
            elapsed_ms = spawned_at.elapsed().as_millis() as u64,
            "backend process spawned"
        );

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::transport("failed to capture subprocess stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::transport("failed to capture subprocess stderr"))?;

        let capture = Arc::new(Mutex::new(StderrCapture::default()));
        let stderr_task = spawn_stderr_loop(name, stderr, capture.clone());

        Ok(Self {
            name,
            child,
            stdin,
            stdout: Some(stdout),
            stderr: capture,
            stderr_task: Some(stderr_task),
            spawned_at,
        })
    }

    pub fn take_lines(&mut self) -> Result<LineStream, GatewayError> {
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| GatewayError::transport("subprocess stdout already taken"))?;
        Ok(LineReader::new(self.name, stdout))
    }

    /// Writes one newline-terminated JSON message and flushes.
    pub async fn write_json(&mut self, payload: &Value) -> Result<(), GatewayError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| GatewayError::transport("subprocess stdin is closed"))?;
        let mut line = serde_json::to_vec(payload).map_err(|err| {
            GatewayError::transport(format!("failed to serialize json-rpc message: {err}"))
        })?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|err| GatewayError::transport(format!("failed to write subprocess stdin: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| GatewayError::transport(format!("failed to flush subprocess stdin: {err}")))?;
        Ok(())
    }

    /// Captured stderr after giving the reader a moment to drain.
    pub async fn stderr_text(&mut self) -> String {
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }
        match self.stderr.lock() {
            Ok(capture) => capture.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, GatewayError> {
        self.child
            .wait()
            .await
            .map_err(|err| GatewayError::transport(format!("failed to wait for {}: {err}", self.name)))
    }

    pub async fn kill(&mut self) {
        tracing::info!(
            backend = self.name,
            age_ms = self.spawned_at.elapsed().as_millis() as u64,
            "killing backend process"
        );
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Flushes stdin, kills the process and waits for it to exit.
    pub async fn close(mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush().await;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => self.kill().await,
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Newline-delimited reader over raw bytes.
///
/// Lines are returned as bytes; decoding is left to the caller so one line of
/// binary noise never ends the stream.
#[derive(Debug)]
pub struct LineReader<R> {
    name: &'static str,
    reader: BufReader<R>,
    line: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(name: &'static str, inner: R) -> Self {
        Self::with_limit(name, inner, MAX_LINE_BYTES)
    }

    pub fn with_limit(name: &'static str, inner: R, limit: usize) -> Self {
        Self {
            name,
            reader: BufReader::new(inner),
            line: Vec::new(),
            limit,
        }
    }

    /// Next non-blank line without its terminator, skipping lines over the
    /// limit. `None` at EOF.
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, GatewayError> {
        loop {
            let Some(line_bytes) = self.read_bounded().await? else {
                return Ok(None);
            };
            if line_bytes > self.limit {
                tracing::warn!(
                    backend = self.name,
                    line_bytes,
                    limit = self.limit,
                    "backend output: line too long, skipped"
                );
                continue;
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(std::mem::take(&mut self.line)));
        }
    }

    /// Reads up to the next `\n`, buffering at most `limit` bytes. Returns the
    /// full line length, or `None` at EOF with nothing read.
    async fn read_bounded(&mut self) -> Result<Option<usize>, GatewayError> {
        self.line.clear();
        let mut seen = 0usize;
        loop {
            let chunk = self.reader.fill_buf().await.map_err(|err| {
                GatewayError::transport(format!("failed to read {} output: {err}", self.name))
            })?;
            if chunk.is_empty() {
                return Ok((seen > 0).then_some(seen));
            }
            let (take, done) = match chunk.iter().position(|byte| *byte == b'\n') {
                Some(pos) => (pos, true),
                None => (chunk.len(), false),
            };
            seen += take;
            if seen <= self.limit {
                self.line.extend_from_slice(&chunk[..take]);
            } else if !self.line.is_empty() {
                self.line = Vec::new();
            }
            self.reader.consume(if done { take + 1 } else { take });
            if done {
                return Ok(Some(seen));
            }
        }
    }
}

fn spawn_stderr_loop(
    name: &'static str,
    stderr: ChildStderr,
    capture: Arc<Mutex<StderrCapture>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = LineReader::new(name, stderr);
        while let Ok(Some(line)) = lines.next_line().await {
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            tracing::debug!(backend = name, line = %line, "backend stderr");
            match capture.lock() {
                Ok(mut guard) => guard.record(line),
                Err(poisoned) => poisoned.into_inner().record(line),
            }
        }
    })
}

fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let safe = value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':' | '='));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}
