//! Process Test Runner - stdin/stdout protocol
//!
//! **Core Responsibility:**
//! Run the user's program against one stdin payload and capture what it
//! does: stdout, stderr and exit code.
//!
//! **Boundary:**
//! - Runner knows HOW to execute a program under a deadline
//! - Runner does NOT know whether the output is correct
//! - A non-zero exit is an observation, not an error
//!
//! The program is treated as an interactive CLI that reads all of its input
//! and then exits: the whole payload is written, stdin is closed, and the
//! runner waits for exit.

use crate::error::EngineError;
use crate::process_tree::{terminate_process_tree, ProcessTree};
use stagecheck_common::types::{TestResult, EXIT_NOT_COMPLETED};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Split a run command on whitespace into program and arguments
pub fn split_command(command: &str) -> Result<(String, Vec<String>), EngineError> {
    let mut parts = command.split_whitespace().map(str::to_string);
    match parts.next() {
        Some(program) => Ok((program, parts.collect())),
        None => Err(EngineError::Input("run command is empty".to_string())),
    }
}

pub struct ProcessRunner {
    termination_grace: Duration,
}

impl ProcessRunner {
    pub fn new(termination_grace: Duration) -> Self {
        Self { termination_grace }
    }

    /// Execute `command` with `stdin` as its entire input.
    ///
    /// **Errors:**
    /// - `Input` for an empty command
    /// - `Spawn` if the program cannot be started
    /// - `StdinWrite` if the payload cannot be delivered
    /// - `Timeout` if the program is still running after `timeout`; the
    ///   program and everything it spawned are terminated first
    ///
    /// The returned result has an empty test name; the caller fills it in.
    #[instrument(skip(self, stdin), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn run(&self, command: &str, stdin: &str, timeout: Duration) -> Result<TestResult, EngineError> {
        let (program, args) = split_command(command)?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut tree = ProcessTree::spawn(&mut cmd).map_err(|source| EngineError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdout_task = spawn_capture(tree.child_mut().stdout.take());
        let stderr_task = spawn_capture(tree.child_mut().stderr.take());

        let start_time = Instant::now();
        let outcome = tokio::time::timeout(timeout, feed_and_wait(tree.child_mut(), stdin)).await;
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        // Sweep the tree on every path; after a normal exit this only
        // removes background children still holding the output pipes.
        if let Err(e) = terminate_process_tree(&mut tree, self.termination_grace).await {
            warn!(error = %e, "Failed to terminate process tree");
        }

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(e);
            }
            Err(_) => {
                warn!(execution_time_ms, "Execution timed out; process tree terminated");
                stdout_task.abort();
                stderr_task.abort();
                return Err(EngineError::Timeout(timeout));
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let exit_code = exit_code(status);

        debug!(exit_code, execution_time_ms, stdout_bytes = stdout.len(), "Execution completed");

        Ok(TestResult {
            test_name: String::new(),
            exit_code,
            stdout,
            stderr,
            http_responses: Vec::new(),
        })
    }
}

async fn feed_and_wait(child: &mut Child, stdin: &str) -> Result<ExitStatus, EngineError> {
    if let Some(mut pipe) = child.stdin.take() {
        match pipe.write_all(stdin.as_bytes()).await {
            Ok(()) => {}
            // The program exited or closed stdin without reading everything
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Program closed stdin before reading all input");
            }
            Err(e) => return Err(EngineError::StdinWrite(e)),
        }
        // Dropping the pipe signals end-of-input
        drop(pipe);
    }

    child.wait().await.map_err(EngineError::Wait)
}

fn spawn_capture<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buffer).await {
                debug!(error = %e, "Output stream closed with error");
            }
        }
        buffer
    })
}

async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    match task.await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "Output capture task failed");
            String::new()
        }
    }
}

/// Exit code, or -1 when the program was killed by a signal
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_NOT_COMPLETED)
}
