use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// A single filesystem operation that failed during staging
#[derive(Debug, Error)]
#[error("failed to {action} {}: {source}", .path.display())]
pub struct FsFailure {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Why a request to the server under test did not produce a usable response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// Response had no `Content-Length` (absent or chunked)
    MissingContentLength,
    ServerTimeout,
    ConnectionFailed,
    Other(String),
}

impl HttpFailure {
    /// Message shown to the user, with a next step where there is one
    pub fn user_message(&self) -> &str {
        match self {
            HttpFailure::MissingContentLength => {
                "Your server response is missing the Content-Length header.\n→ Add 'Content-Length: 0'."
            }
            HttpFailure::ServerTimeout => "Server took too long to respond.",
            HttpFailure::ConnectionFailed => "Could not connect to server.",
            HttpFailure::Other(message) => message,
        }
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.user_message())
    }
}

/// Coarse classification used when reporting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Setup,
    Execution,
    Protocol,
    Cleanup,
    Adjudication,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Input(String),

    #[error(transparent)]
    Setup(#[from] FsFailure),

    #[error("cleanup failed:\n{}", join_failures(.0))]
    Cleanup(Vec<FsFailure>),

    #[error("failed to start command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write stdin: {0}")]
    StdinWrite(#[source] io::Error),

    #[error("command timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("command execution failed: {0}")]
    Wait(#[source] io::Error),

    #[error("server exited during startup ({0})")]
    ServerExited(ExitStatus),

    #[error("{method} {path}\n\n  → {failure}")]
    Http {
        method: String,
        path: String,
        failure: HttpFailure,
    },

    #[error("submission failed for stage {stage_number}: {reason}")]
    Adjudication { stage_number: u32, reason: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Input(_) => ErrorKind::Input,
            EngineError::Setup(_) => ErrorKind::Setup,
            EngineError::Cleanup(_) => ErrorKind::Cleanup,
            EngineError::Spawn { .. }
            | EngineError::StdinWrite(_)
            | EngineError::Timeout(_)
            | EngineError::Wait(_)
            | EngineError::ServerExited(_) => ErrorKind::Execution,
            EngineError::Http { .. } => ErrorKind::Protocol,
            EngineError::Adjudication { .. } => ErrorKind::Adjudication,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }

    pub fn http_failure(&self) -> Option<&HttpFailure> {
        match self {
            EngineError::Http { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

fn join_failures(failures: &[FsFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
