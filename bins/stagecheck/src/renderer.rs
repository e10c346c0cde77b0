//! Renderer - the single consumer of the Event Pipeline
//!
//! Runs as its own task so terminal I/O never stalls test execution.
//! After the orchestrator drops its sender the renderer drains whatever is
//! still queued, then prints the final summary.

use crate::events::{ErrorClass, EventReceiver, PassState, ProgressEvent, TestResolution};
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Final outcome handed to the renderer once the run is over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub success: bool,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub feedback: String,
    /// Printed ahead of the totals, e.g. which stage stopped the cascade
    pub notice: Option<String>,
    /// Suite-level failure that ended the run early
    pub error: Option<String>,
}

pub trait Renderer: Send + 'static {
    fn handle(&mut self, event: ProgressEvent);
    fn complete(&mut self, summary: &RunSummary);
}

pub struct RendererHandle<R> {
    task: JoinHandle<R>,
    summary_tx: oneshot::Sender<RunSummary>,
}

/// Start consuming `events` on a background task
pub fn spawn_renderer<R: Renderer>(mut renderer: R, mut events: EventReceiver) -> RendererHandle<R> {
    let (summary_tx, summary_rx) = oneshot::channel::<RunSummary>();

    let task = tokio::spawn(async move {
        let mut handled = 0usize;
        while let Some(event) = events.recv().await {
            renderer.handle(event);
            handled += 1;
        }
        debug!(handled, "Event pipeline drained");

        match summary_rx.await {
            Ok(summary) => renderer.complete(&summary),
            Err(_) => debug!("Renderer finished without a summary"),
        }
        renderer
    });

    RendererHandle { task, summary_tx }
}

impl<R: Renderer> RendererHandle<R> {
    /// Hand over the summary and wait up to `grace` for the renderer to
    /// drain and finish.
    ///
    /// The event sender must already be dropped; otherwise the renderer is
    /// still waiting for events and is aborted when `grace` runs out.
    pub async fn finish(self, summary: RunSummary, grace: Duration) -> Option<R> {
        let RendererHandle { mut task, summary_tx } = self;
        let _ = summary_tx.send(summary);

        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(renderer)) => Some(renderer),
            Ok(Err(e)) => {
                warn!(error = %e, "Renderer task failed");
                None
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Renderer did not finish in time, aborting");
                task.abort();
                None
            }
        }
    }
}

const BUILD_NOISE: &[&str] = &["Finished", "Compiling", "Running", "Build succeeded", "Build complete"];

/// True when every non-blank line of `stderr` is toolchain progress output
pub fn is_build_noise(stderr: &str) -> bool {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(|line| BUILD_NOISE.iter().any(|pattern| line.contains(pattern)))
}

const INDENT: &str = "     ";

fn class_label(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::SetupFailed => "setup failed",
        ErrorClass::RunnerFailed => "did not complete",
        ErrorClass::AdjudicationFailed => "submission failed",
    }
}

struct TestView {
    name: String,
    shown: bool,
}

struct StageView {
    tests: Vec<TestView>,
}

/// Plain-text progress on a terminal
///
/// In local-check mode every test is printed as soon as it resolves, with
/// its input and output. In submit mode only adjudicated tests are printed,
/// and details only for failures.
pub struct ConsoleRenderer<W: Write> {
    out: W,
    submit: bool,
    stages: Vec<StageView>,
}

impl ConsoleRenderer<io::Stdout> {
    pub fn stdout(submit: bool) -> Self {
        Self::new(io::stdout(), submit)
    }
}

impl<W: Write> ConsoleRenderer<W> {
    pub fn new(out: W, submit: bool) -> Self {
        Self {
            out,
            submit,
            stages: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn on_event(&mut self, event: ProgressEvent) -> io::Result<()> {
        match event {
            ProgressEvent::StageStart { number, name } => {
                self.stages.push(StageView { tests: Vec::new() });
                writeln!(self.out, "Stage {:02}: {}", number, name)?;
            }
            ProgressEvent::TestStart { name, .. } => match self.stages.last_mut() {
                Some(stage) => stage.tests.push(TestView { name, shown: false }),
                None => debug!(test = %name, "Test started outside any stage"),
            },
            ProgressEvent::TestResolved(resolution) => self.on_resolved(&resolution)?,
            ProgressEvent::StageResolved { stage_index, state } => {
                debug!(stage_index, ?state, "Stage resolved");
            }
        }
        self.out.flush()
    }

    fn on_resolved(&mut self, resolution: &TestResolution) -> io::Result<()> {
        let display = !self.submit || resolution.state.is_known();
        let Some(stage) = self.stages.get_mut(resolution.stage_index) else {
            return Ok(());
        };
        let total = stage.tests.len();
        let Some(test) = stage.tests.get_mut(resolution.test_index) else {
            return Ok(());
        };
        if test.shown || !display {
            return Ok(());
        }
        test.shown = true;

        let connector = if resolution.test_index + 1 == total { "└─" } else { "├─" };
        let name = test.name.clone();

        if !self.submit {
            match resolution.error {
                Some(class) => writeln!(self.out, "  {} {} [{}]", connector, name, class_label(class))?,
                None => writeln!(self.out, "  {} {}", connector, name)?,
            }
            self.write_details(resolution)?;
            if resolution.error.is_none() && resolution.exit_code != 0 {
                writeln!(self.out, "{}Exit code: {}", INDENT, resolution.exit_code)?;
                writeln!(self.out)?;
            }
            return Ok(());
        }

        let passed = resolution.state == PassState::Passed;
        let icon = if passed { "✓" } else { "✗" };
        writeln!(self.out, "  {} {} {}", connector, icon, name)?;
        if !passed {
            self.write_details(resolution)?;
            if let Some(reason) = resolution.failure_reason.as_deref().filter(|r| !r.is_empty()) {
                writeln!(self.out, "{}Error: {}", INDENT, reason)?;
                writeln!(self.out)?;
            }
        }
        Ok(())
    }

    /// Input lines paired with the output printed after each `$ ` prompt
    fn write_details(&mut self, resolution: &TestResolution) -> io::Result<()> {
        if !resolution.stdin.is_empty() {
            let mut outputs: Vec<&str> = resolution.stdout.split("$ ").collect();
            if outputs.first() == Some(&"") {
                outputs.remove(0);
            }

            writeln!(self.out)?;
            for (i, command) in resolution.stdin.trim_end_matches('\n').split('\n').enumerate() {
                writeln!(self.out, "{}$ {}", INDENT, command)?;
                if let Some(output) = outputs.get(i).map(|o| o.trim()) {
                    if output.is_empty() {
                        writeln!(self.out, "{}  (no output)", INDENT)?;
                    } else {
                        for line in output.lines().filter(|l| !l.is_empty()) {
                            writeln!(self.out, "{}  {}", INDENT, line)?;
                        }
                    }
                }
                writeln!(self.out)?;
            }
        }

        if !resolution.stderr.is_empty() && !is_build_noise(&resolution.stderr) {
            writeln!(self.out, "{}Error:", INDENT)?;
            self.write_error(&resolution.stderr)?;
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn write_error(&mut self, stderr: &str) -> io::Result<()> {
        const REQUEST_PREFIXES: &[&str] = &["GET ", "POST ", "PUT ", "DELETE ", "PATCH "];

        for line in stderr.trim_end_matches('\n').lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if REQUEST_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
                writeln!(self.out, "{}  $ {}", INDENT, trimmed)?;
            } else if let Some((before, hint)) = trimmed.split_once('→') {
                let before = before.trim();
                if !before.is_empty() {
                    writeln!(self.out, "{}  {}", INDENT, before)?;
                }
                writeln!(self.out, "{}  → {}", INDENT, hint.trim())?;
            } else {
                writeln!(self.out, "{}  {}", INDENT, line)?;
            }
        }
        Ok(())
    }

    fn write_summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        if let Some(notice) = &summary.notice {
            writeln!(self.out)?;
            writeln!(self.out, "⚠ {}", notice)?;
        }
        if self.submit {
            writeln!(self.out)?;
            if summary.success {
                writeln!(self.out, "✓ All {} tests passed!", summary.total_tests)?;
            } else {
                writeln!(self.out, "✗ {}/{} tests passed", summary.passed_tests, summary.total_tests)?;
            }
        }
        if let Some(error) = &summary.error {
            writeln!(self.out, "Error: {}", error)?;
        }
        if !summary.feedback.is_empty() {
            writeln!(self.out, "{}", summary.feedback)?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}

impl<W: Write + Send + 'static> Renderer for ConsoleRenderer<W> {
    fn handle(&mut self, event: ProgressEvent) {
        if let Err(e) = self.on_event(event) {
            warn!(error = %e, "Failed to write progress");
        }
    }

    fn complete(&mut self, summary: &RunSummary) {
        if let Err(e) = self.write_summary(summary) {
            warn!(error = %e, "Failed to write summary");
        }
    }
}
