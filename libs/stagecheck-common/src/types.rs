use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Exit code reserved for "execution could not complete"
/// (setup failure, launch failure, timeout, protocol error).
pub const EXIT_NOT_COMPLETED: i32 = -1;

/// The grading service sends `null` for empty arrays and maps.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Execution protocol of every test in a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    /// Write stdin, close it, capture stdout/stderr/exit code
    #[default]
    CliInteractive,
    /// Start the program as a server and drive HTTP requests against it
    HttpServer,
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TestType::CliInteractive => write!(f, "cli_interactive"),
            TestType::HttpServer => write!(f, "http_server"),
        }
    }
}

/// How to run the user's program for HTTP tests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramConfig {
    #[serde(default)]
    pub executable: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: BTreeMap<String, String>,
}

/// Where the server under test listens and how long it gets to come up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default)]
    pub startup_wait_ms: u64,
}

impl ServerConfig {
    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreation {
    pub path: PathBuf,
    #[serde(default)]
    pub content: String,
}

/// Filesystem side effects applied before a test runs.
///
/// Deletions always run before creations, whatever order the
/// suite author listed them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    #[serde(default, deserialize_with = "null_as_default")]
    pub create_dirs: Vec<PathBuf>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub create_files: Vec<FileCreation>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub delete_files: Vec<PathBuf>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub delete_dirs: Vec<PathBuf>,
}

/// Filesystem side effects reversed after a test, whatever its outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cleanup {
    #[serde(default, deserialize_with = "null_as_default")]
    pub delete_files: Vec<PathBuf>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub delete_dirs: Vec<PathBuf>,
}

/// A single declarative test.
///
/// `stdin` is only read for `cli_interactive` stages and `http_requests`
/// only for `http_server` stages; the owning stage decides which.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    #[serde(rename = "testName")]
    pub name: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub http_requests: Vec<HttpRequest>,
    #[serde(default)]
    pub setup: Option<Setup>,
    #[serde(default)]
    pub cleanup: Option<Cleanup>,
}

impl Test {
    /// Declared timeout, or `fallback` when the suite left it unset (0)
    pub fn timeout_or(&self, fallback: Duration) -> Duration {
        if self.timeout_seconds == 0 {
            fallback
        } else {
            Duration::from_secs(self.timeout_seconds)
        }
    }
}

/// One checkpoint of a cascaded suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub id: Uuid,
    pub number: u32,
    pub name: String,
    pub test_type: TestType,
    pub program_config: Option<ProgramConfig>,
    pub server_config: Option<ServerConfig>,
    pub tests: Vec<Test>,
}

/// Stages to run, prerequisite-ordered, ending with the requested stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSuite {
    pub target_stage_id: Uuid,
    pub target_stage_number: u32,
    pub stages: Vec<Stage>,
}

impl TestSuite {
    pub fn total_tests(&self) -> usize {
        self.stages.iter().map(|s| s.tests.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: BTreeMap<String, String>,
}

/// Captured behavior of one test, as handed to the grading service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_name: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub http_responses: Vec<HttpResponse>,
}

impl TestResult {
    /// Result recorded when the test could not run to completion
    pub fn not_completed(test_name: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            exit_code: EXIT_NOT_COMPLETED,
            stdout: String::new(),
            stderr: stderr.into(),
            http_responses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub stage_uuid: Uuid,
    pub language: String,
    pub test_results: Vec<TestResult>,
    pub target_stage_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFailure {
    pub test_name: String,
    #[serde(default)]
    pub reason: String,
}

/// Verdict returned by the grading service for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub passed: bool,
    #[serde(default)]
    pub total_tests: u32,
    #[serde(default)]
    pub passed_tests: u32,
    #[serde(default)]
    pub failed_tests: u32,
    #[serde(default)]
    pub feedback: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub test_failures: Vec<TestFailure>,
}

impl SubmissionResult {
    /// Failure entry for `test_name`; `None` means the test passed
    pub fn failure_for(&self, test_name: &str) -> Option<&TestFailure> {
        self.test_failures.iter().find(|f| f.test_name == test_name)
    }
}
