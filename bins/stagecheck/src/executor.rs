//! Test Orchestrator
//!
//! **Core Responsibility:**
//! Walk a suite stage by stage and test by test, strictly sequentially:
//! stage the filesystem, run the test with the runner its stage selects,
//! reverse the staging, and report every step on the Event Pipeline.
//!
//! **Boundary:**
//! - Never judges output; pass/fail only ever comes from the adjudicator
//! - Per-test failures become a `-1` result plus an event, the suite goes on
//! - A failed submission ends the whole run
//!
//! **Cascade policy:**
//! In submit mode a stage that is adjudicated as failed stops the cascade.
//! Local checks run every stage regardless.

use crate::adjudicator::Adjudicator;
use crate::engine::ProcessRunner;
use crate::error::EngineError;
use crate::events::{ErrorClass, EventSender, PassState, ProgressEvent, TestResolution};
use crate::http_runner::HttpServerRunner;
use crate::renderer::RunSummary;
use crate::stager::{apply_setup, CleanupGuard};
use anyhow::Result;
use stagecheck_common::config::EngineConfig;
use stagecheck_common::types::{
    Stage, SubmissionRequest, SubmissionResult, Test, TestResult, TestSuite, TestType, EXIT_NOT_COMPLETED,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub enum RunMode {
    /// Surface captured output only; every verdict stays unknown
    LocalCheck,
    /// Submit each stage for adjudication and stop at the first failed stage
    Submit {
        language: String,
        adjudicator: Arc<dyn Adjudicator>,
    },
}

impl RunMode {
    pub fn is_submit(&self) -> bool {
        matches!(self, RunMode::Submit { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub number: u32,
    pub name: String,
    pub results: Vec<TestResult>,
    pub state: PassState,
    pub verdict: Option<SubmissionResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteOutcome {
    pub stages: Vec<StageOutcome>,
    pub target_stage_number: u32,
    /// Tests in every stage that was started
    pub total_tests: usize,
    /// Tests the adjudicator accepted; always 0 for local checks
    pub passed_tests: usize,
    pub submitted: bool,
    /// Stage whose failed verdict stopped the cascade
    pub halted_at: Option<u32>,
}

impl SuiteOutcome {
    /// Completion summary; `hint` is shown after local checks
    pub fn summary(&self, hint: &str) -> RunSummary {
        let notice = self.halted_at.map(|number| {
            format!(
                "Stage {} failed. Stopping at stage {} (requested stage {})",
                number, number, self.target_stage_number
            )
        });

        if !self.submitted {
            return RunSummary {
                success: true,
                total_tests: self.total_tests,
                passed_tests: 0,
                feedback: hint.to_string(),
                notice,
                error: None,
            };
        }

        match self.stages.iter().rev().find_map(|s| s.verdict.as_ref()) {
            Some(verdict) => RunSummary {
                success: verdict.passed,
                total_tests: self.total_tests,
                passed_tests: self.passed_tests,
                feedback: verdict.feedback.clone(),
                notice,
                error: None,
            },
            None => RunSummary {
                success: false,
                total_tests: self.total_tests,
                passed_tests: self.passed_tests,
                feedback: "No tests were run".to_string(),
                notice,
                error: None,
            },
        }
    }
}

/// Run ended early by a suite-level failure
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SuiteAborted {
    #[source]
    pub error: EngineError,
    /// Everything completed before the failure
    pub partial: SuiteOutcome,
}

impl SuiteAborted {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            success: false,
            total_tests: self.partial.total_tests,
            passed_tests: self.partial.passed_tests,
            feedback: String::new(),
            notice: None,
            error: Some(self.error.to_string()),
        }
    }
}

/// One test's captured result plus how its execution went wrong, if it did
struct Executed {
    result: TestResult,
    input: String,
    error: Option<ErrorClass>,
}

pub struct Orchestrator {
    process_runner: ProcessRunner,
    http_runner: HttpServerRunner,
    run_command: String,
    default_timeout: Duration,
    mode: RunMode,
    events: EventSender,
}

impl Orchestrator {
    pub fn new(config: &EngineConfig, run_command: impl Into<String>, mode: RunMode, events: EventSender) -> Result<Self> {
        Ok(Self {
            process_runner: ProcessRunner::new(config.termination_grace),
            http_runner: HttpServerRunner::new(config.request_timeout, config.termination_grace)?,
            run_command: run_command.into(),
            default_timeout: config.default_test_timeout,
            mode,
            events,
        })
    }

    /// Run the suite to completion or until the cascade stops.
    ///
    /// Consumes the orchestrator so the event sender is dropped on return,
    /// which tells the renderer no more events are coming.
    #[instrument(skip_all, fields(target_stage = suite.target_stage_number, stages = suite.stages.len()))]
    pub async fn run(self, suite: &TestSuite) -> Result<SuiteOutcome, SuiteAborted> {
        let mut outcome = SuiteOutcome {
            target_stage_number: suite.target_stage_number,
            submitted: self.mode.is_submit(),
            ..Default::default()
        };
        let start = Instant::now();

        for (stage_index, stage) in suite.stages.iter().enumerate() {
            outcome.total_tests += stage.tests.len();
            self.events
                .emit(ProgressEvent::StageStart {
                    number: stage.number,
                    name: stage.name.clone(),
                })
                .await;

            let mut executed = Vec::with_capacity(stage.tests.len());
            for (test_index, test) in stage.tests.iter().enumerate() {
                let run = self.run_test(stage, test).await;
                self.events
                    .emit(ProgressEvent::TestResolved(resolution(stage_index, test_index, stage, &run, PassState::Unknown, None)))
                    .await;
                executed.push(run);
            }

            let mut stage_outcome = StageOutcome {
                number: stage.number,
                name: stage.name.clone(),
                results: executed.iter().map(|e| e.result.clone()).collect(),
                state: PassState::Unknown,
                verdict: None,
            };

            if let RunMode::Submit { language, adjudicator } = &self.mode {
                let request = SubmissionRequest {
                    stage_uuid: stage.id,
                    language: language.clone(),
                    test_results: stage_outcome.results.clone(),
                    target_stage_number: Some(suite.target_stage_number),
                };

                let verdict = match adjudicator.submit(&request).await {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        let reason = format!("{:#}", e);
                        warn!(stage = stage.number, error = %reason, "Submission failed");
                        for (test_index, run) in executed.iter().enumerate() {
                            let mut event = resolution(stage_index, test_index, stage, run, PassState::Unknown, Some(reason.as_str()));
                            event.error = Some(ErrorClass::AdjudicationFailed);
                            self.events.emit(ProgressEvent::TestResolved(event)).await;
                        }
                        outcome.stages.push(stage_outcome);
                        return Err(SuiteAborted {
                            error: EngineError::Adjudication {
                                stage_number: stage.number,
                                reason,
                            },
                            partial: outcome,
                        });
                    }
                };

                for (test_index, run) in executed.iter().enumerate() {
                    let failure = verdict.failure_for(&run.result.test_name);
                    let state = PassState::from_verdict(failure.is_none());
                    if state == PassState::Passed {
                        outcome.passed_tests += 1;
                    }
                    let reason = failure.map(|f| f.reason.as_str());
                    self.events
                        .emit(ProgressEvent::TestResolved(resolution(stage_index, test_index, stage, run, state, reason)))
                        .await;
                }

                stage_outcome.state = PassState::from_verdict(verdict.passed);
                stage_outcome.verdict = Some(verdict);
            }

            let state = stage_outcome.state;
            self.events.emit(ProgressEvent::StageResolved { stage_index, state }).await;
            info!(stage = stage.number, ?state, tests = stage.tests.len(), "Stage finished");
            outcome.stages.push(stage_outcome);

            if state == PassState::Failed {
                warn!(stage = stage.number, target = suite.target_stage_number, "Stage failed, stopping cascade");
                outcome.halted_at = Some(stage.number);
                break;
            }
        }

        info!(
            total_tests = outcome.total_tests,
            passed_tests = outcome.passed_tests,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Suite finished"
        );
        Ok(outcome)
    }

    /// Stage, execute and clean up one test
    #[instrument(skip_all, fields(stage = stage.number, test = %test.name))]
    async fn run_test(&self, stage: &Stage, test: &Test) -> Executed {
        let input = displayed_input(test);
        self.events
            .emit(ProgressEvent::TestStart {
                name: test.name.clone(),
                input: input.clone(),
            })
            .await;

        let start = Instant::now();
        let outcome = self.stage_and_execute(stage, test).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                debug!(exit_code = result.exit_code, elapsed_ms, "Test executed");
                Executed {
                    result,
                    input,
                    error: None,
                }
            }
            Err((class, e)) => {
                let message = match class {
                    ErrorClass::SetupFailed => format!("setup failed: {}", e),
                    _ => e.to_string(),
                };
                warn!(
                    ?class,
                    kind = ?e.kind(),
                    timed_out = e.is_timeout(),
                    http_failure = ?e.http_failure(),
                    elapsed_ms,
                    error = %message,
                    "Test did not complete"
                );
                Executed {
                    result: TestResult::not_completed(test.name.clone(), message),
                    input,
                    error: Some(class),
                }
            }
        }
    }

    async fn stage_and_execute(&self, stage: &Stage, test: &Test) -> Result<TestResult, (ErrorClass, EngineError)> {
        // Cleanup runs when the guard leaves scope, including on setup failure
        let guard = CleanupGuard::new(&test.name, test.cleanup.as_ref());

        if let Some(setup) = &test.setup {
            apply_setup(setup).map_err(|e| (ErrorClass::SetupFailed, e))?;
        }

        let outcome = self.execute(stage, test).await;

        if let Err(e) = guard.finish() {
            warn!(error = %e, "Cleanup failed");
        }

        outcome.map_err(|e| (ErrorClass::RunnerFailed, e))
    }

    async fn execute(&self, stage: &Stage, test: &Test) -> Result<TestResult, EngineError> {
        match stage.test_type {
            TestType::CliInteractive => {
                let timeout = test.timeout_or(self.default_timeout);
                let mut result = self.process_runner.run(&self.run_command, &test.stdin, timeout).await?;
                result.test_name = test.name.clone();
                Ok(result)
            }
            TestType::HttpServer => {
                self.http_runner
                    .run(
                        stage.program_config.as_ref(),
                        stage.server_config.as_ref(),
                        &self.run_command,
                        test,
                    )
                    .await
            }
        }
    }
}

fn resolution(
    stage_index: usize,
    test_index: usize,
    stage: &Stage,
    run: &Executed,
    state: PassState,
    failure_reason: Option<&str>,
) -> TestResolution {
    let stdout = if run.error.is_some() {
        String::new()
    } else {
        format_test_output(stage.test_type, &run.result)
    };

    TestResolution {
        stage_index,
        test_index,
        state,
        stdin: run.input.clone(),
        stdout,
        stderr: run.result.stderr.clone(),
        exit_code: if run.error.is_some() { EXIT_NOT_COMPLETED } else { run.result.exit_code },
        failure_reason: failure_reason.map(str::to_string),
        error: run.error,
    }
}

/// Input as shown to the user: the first HTTP request line, or the stdin
pub fn displayed_input(test: &Test) -> String {
    match test.http_requests.first() {
        Some(request) => format!("{} {}", request.method, request.path),
        None => test.stdin.clone(),
    }
}

/// Output as shown to the user; HTTP responses are rendered like a raw exchange
pub fn format_test_output(test_type: TestType, result: &TestResult) -> String {
    if test_type != TestType::HttpServer || result.http_responses.is_empty() {
        return result.stdout.clone();
    }

    let mut output = String::new();
    for (i, response) in result.http_responses.iter().enumerate() {
        if i > 0 {
            output.push_str("\n---\n");
        }
        output.push_str(&format!("HTTP {}\n", response.status_code));
        for (name, value) in &response.headers {
            output.push_str(&format!("{}: {}\n", name, value));
        }
        if !response.body.is_empty() {
            output.push('\n');
            output.push_str(&response.body);
        }
    }
    output
}
