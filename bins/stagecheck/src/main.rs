mod adjudicator;
mod engine;
mod error;
mod events;
mod executor;
mod http_runner;
mod process_tree;
mod renderer;
mod stager;


use adjudicator::HttpAdjudicator;
use anyhow::Result;
use clap::{Parser, Subcommand};
use events::event_pipeline;
use executor::{Orchestrator, RunMode};
use renderer::{spawn_renderer, ConsoleRenderer};
use stagecheck_common::config::EngineConfig;
use stagecheck_common::suite::load_suite;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "stagecheck")]
#[command(about = "Run staged behavioral test suites against your program", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage locally and show the captured output
    Test {
        /// Cascaded suite definition (JSON)
        suite: PathBuf,

        /// Command that starts your program (e.g. "./your_program.sh")
        #[arg(short, long, env = "STAGECHECK_RUN_COMMAND", default_value = "")]
        cmd: String,
    },

    /// Run the stages in order and submit each one for grading
    Run {
        /// Cascaded suite definition (JSON)
        suite: PathBuf,

        /// Command that starts your program (e.g. "./your_program.sh")
        #[arg(short, long, env = "STAGECHECK_RUN_COMMAND", default_value = "")]
        cmd: String,

        /// Language tag sent with the submission (e.g. rust, go, python)
        #[arg(short, long, env = "STAGECHECK_LANGUAGE")]
        language: String,
    },
}

fn init_tracing(json: bool) {
    // Default to warn so logs never drown the progress output
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = EngineConfig::from_env()?;
    debug!(?config, "Configuration loaded");

    let (suite_path, cmd, mode) = match cli.command {
        Commands::Test { suite, cmd } => (suite, cmd, RunMode::LocalCheck),
        Commands::Run { suite, cmd, language } => {
            let adjudicator = HttpAdjudicator::from_config(&config)?;
            (
                suite,
                cmd,
                RunMode::Submit {
                    language,
                    adjudicator: Arc::new(adjudicator),
                },
            )
        }
    };
    let submit = mode.is_submit();

    let suite = load_suite(&suite_path)?;
    info!(
        path = %suite_path.display(),
        stages = suite.stages.len(),
        tests = suite.total_tests(),
        target_stage = suite.target_stage_number,
        "Suite loaded"
    );

    if submit {
        let first = suite.stages.first().map(|s| s.number).unwrap_or(suite.target_stage_number);
        println!(
            "Running stages {} through {} ({} total stages)\n",
            first,
            suite.target_stage_number,
            suite.stages.len()
        );
    }

    let (events, receiver) = event_pipeline(config.event_capacity);
    let renderer = spawn_renderer(ConsoleRenderer::stdout(submit), receiver);
    let orchestrator = Orchestrator::new(&config, cmd, mode, events)?;

    let hint = format!(
        "Run 'stagecheck run {} --language <language>' to submit your results",
        suite_path.display()
    );
    let (summary, failed) = match orchestrator.run(&suite).await {
        Ok(outcome) => {
            for stage in &outcome.stages {
                debug!(
                    stage = stage.number,
                    name = %stage.name,
                    state = ?stage.state,
                    tests = stage.results.len(),
                    "Stage outcome"
                );
            }
            let summary = outcome.summary(&hint);
            let failed = submit && !summary.success;
            (summary, failed)
        }
        Err(aborted) => (aborted.summary(), true),
    };

    renderer.finish(summary, config.drain_grace).await;

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
