//! HTTP Server Test Runner - request/response protocol
//!
//! **Lifecycle:** `NotStarted → Starting → Ready → Serving → Stopped`
//!
//! - Starting: the program is launched in its own process group with the
//!   stage's environment layered over ours
//! - Ready: assumed once the configured startup wait has elapsed; there is
//!   no health-check polling
//! - Serving: each declared request is sent in order to
//!   `localhost:<port>`, each with its own deadline
//! - Stopped: the whole process group is terminated, on every path
//!
//! The first failing request fails the test; responses collected before it
//! are discarded.

use crate::engine::split_command;
use crate::error::{EngineError, HttpFailure};
use crate::process_tree::{terminate_process_tree, ProcessTree};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use reqwest::{Method, StatusCode};
use stagecheck_common::types::{HttpRequest, HttpResponse, ProgramConfig, ServerConfig, Test, TestResult};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Ready,
    Serving,
    Stopped,
}

/// The server under test for the duration of one test
struct ServerSession {
    tree: ProcessTree,
    state: ServerState,
    termination_grace: Duration,
}

impl ServerSession {
    fn start(command: &mut Command, termination_grace: Duration) -> std::io::Result<Self> {
        let mut session = Self {
            tree: ProcessTree::spawn(command)?,
            state: ServerState::NotStarted,
            termination_grace,
        };
        session.transition(ServerState::Starting);
        Ok(session)
    }

    fn transition(&mut self, next: ServerState) {
        debug!(pid = ?self.tree.id(), from = ?self.state, to = ?next, "Server state change");
        self.state = next;
    }

    /// Wait out the startup grace period, then confirm the server is still up
    async fn await_ready(&mut self, startup_wait: Duration) -> Result<(), EngineError> {
        tokio::time::sleep(startup_wait).await;

        if let Some(status) = self.tree.child_mut().try_wait().map_err(EngineError::Wait)? {
            warn!(%status, "Server exited before it became ready");
            return Err(EngineError::ServerExited(status));
        }

        self.transition(ServerState::Ready);
        Ok(())
    }

    async fn stop(mut self) {
        if let Err(e) = terminate_process_tree(&mut self.tree, self.termination_grace).await {
            warn!(error = %e, "Failed to terminate server process group");
        }
        self.transition(ServerState::Stopped);
    }
}

pub struct HttpServerRunner {
    client: reqwest::Client,
    request_timeout: Duration,
    termination_grace: Duration,
}

impl HttpServerRunner {
    pub fn new(request_timeout: Duration, termination_grace: Duration) -> Result<Self> {
        // Raw bodies only, so Content-Length matches what was on the wire.
        // No pooling: each test talks to a fresh server on the same port.
        let client = reqwest::Client::builder()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            request_timeout,
            termination_grace,
        })
    }

    /// Start the server, drive every request in `test`, stop the server.
    ///
    /// `command` is the project run command; when it is blank the stage's
    /// `ProgramConfig` executable and arguments are launched instead.
    #[instrument(skip_all, fields(test = %test.name))]
    pub async fn run(
        &self,
        program: Option<&ProgramConfig>,
        server: Option<&ServerConfig>,
        command: &str,
        test: &Test,
    ) -> Result<TestResult, EngineError> {
        let program = program
            .ok_or_else(|| EngineError::Input("program config is required for HTTP tests".to_string()))?;
        let server = server
            .ok_or_else(|| EngineError::Input("server config is required for HTTP tests".to_string()))?;

        let (executable, args) = launch_command(command, program)?;
        let mut cmd = Command::new(&executable);
        cmd.args(&args)
            .envs(&program.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut session = ServerSession::start(&mut cmd, self.termination_grace).map_err(|source| {
            EngineError::Spawn {
                command: std::iter::once(executable.clone()).chain(args.iter().cloned()).collect::<Vec<_>>().join(" "),
                source,
            }
        })?;
        info!(port = server.port, startup_wait_ms = server.startup_wait_ms, "Server starting");

        if let Err(e) = session.await_ready(server.startup_wait()).await {
            session.stop().await;
            return Err(e);
        }

        session.transition(ServerState::Serving);
        let outcome = self.send_all(server.port, &test.http_requests).await;
        session.stop().await;

        Ok(TestResult {
            test_name: test.name.clone(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            http_responses: outcome?,
        })
    }

    async fn send_all(&self, port: u16, requests: &[HttpRequest]) -> Result<Vec<HttpResponse>, EngineError> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            match self.send_request(port, request).await {
                Ok(response) => responses.push(response),
                Err(failure) => {
                    warn!(method = %request.method, path = %request.path, ?failure, "Request failed");
                    return Err(EngineError::Http {
                        method: request.method.clone(),
                        path: request.path.clone(),
                        failure,
                    });
                }
            }
        }
        Ok(responses)
    }

    async fn send_request(&self, port: u16, request: &HttpRequest) -> Result<HttpResponse, HttpFailure> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| HttpFailure::Other(format!("invalid HTTP method {:?}", request.method)))?;
        let url = request_url(port, &request.path);

        let mut builder = self.client.request(method.clone(), &url).timeout(self.request_timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(classify)?;
        let status_code = response.status().as_u16();

        if declared_length(&method, response.status(), response.headers()).is_none() {
            return Err(HttpFailure::MissingContentLength);
        }
        let headers = canonical_headers(response.headers());
        let body = response.bytes().await.map_err(classify)?;

        debug!(status_code, body_bytes = body.len(), "Response received");

        Ok(HttpResponse {
            status_code,
            body: String::from_utf8_lossy(&body).into_owned(),
            headers,
        })
    }
}

fn launch_command(command: &str, program: &ProgramConfig) -> Result<(String, Vec<String>), EngineError> {
    if !command.trim().is_empty() {
        return split_command(command);
    }
    if program.executable.trim().is_empty() {
        return Err(EngineError::Input(
            "run command is empty and the stage declares no executable".to_string(),
        ));
    }
    Ok((program.executable.clone(), program.args.clone()))
}

fn request_url(port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("http://localhost:{}{}", port, path)
    } else {
        format!("http://localhost:{}/{}", port, path)
    }
}

/// Declared body length; `None` when absent (including chunked) or unparseable.
///
/// Responses that cannot carry a body (HEAD replies, 1xx, 204, 304) have
/// length 0 whatever their headers say.
fn declared_length(method: &Method, status: StatusCode, headers: &HeaderMap) -> Option<u64> {
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Some(0);
    }
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn classify(error: reqwest::Error) -> HttpFailure {
    if error.is_timeout() {
        HttpFailure::ServerTimeout
    } else if error.is_connect() {
        HttpFailure::ConnectionFailed
    } else {
        HttpFailure::Other(error.to_string())
    }
}

/// First value of each header, keyed `Content-Length` style
fn canonical_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        out.entry(canonical_header_name(name.as_str()))
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer every connection with `response` after reading the request head
    async fn fake_server(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut seen = Vec::new();
                    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => seen.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    /// Accepts connections and never answers
    async fn silent_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (port, handle)
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn runner(request_timeout: Duration) -> HttpServerRunner {
        HttpServerRunner::new(request_timeout, Duration::from_millis(500)).unwrap()
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    fn http_test(requests: Vec<HttpRequest>) -> Test {
        Test {
            name: "http".to_string(),
            stdin: String::new(),
            timeout_seconds: 5,
            http_requests: requests,
            setup: None,
            cleanup: None,
        }
    }

    fn server_config(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            startup_wait_ms: 50,
        }
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-length"), "Content-Length");
        assert_eq!(canonical_header_name("x-request-ID"), "X-Request-Id");
        assert_eq!(canonical_header_name("etag"), "Etag");
    }

    #[test]
    fn test_bodyless_responses_have_zero_length() {
        let empty = HeaderMap::new();
        assert_eq!(declared_length(&Method::DELETE, StatusCode::NO_CONTENT, &empty), Some(0));
        assert_eq!(declared_length(&Method::GET, StatusCode::NOT_MODIFIED, &empty), Some(0));
        assert_eq!(declared_length(&Method::GET, StatusCode::CONTINUE, &empty), Some(0));
        assert_eq!(declared_length(&Method::HEAD, StatusCode::OK, &empty), Some(0));
        assert_eq!(declared_length(&Method::GET, StatusCode::OK, &empty), None);

        let mut declared = HeaderMap::new();
        declared.insert(CONTENT_LENGTH, "12".parse().unwrap());
        assert_eq!(declared_length(&Method::GET, StatusCode::OK, &declared), Some(12));
    }

    #[test]
    fn test_request_url_adds_leading_slash() {
        assert_eq!(request_url(8080, "/echo/abc"), "http://localhost:8080/echo/abc");
        assert_eq!(request_url(8080, "files"), "http://localhost:8080/files");
    }

    #[test]
    fn test_launch_command_prefers_run_command() {
        let program = ProgramConfig {
            executable: "./server".to_string(),
            args: vec!["--port".to_string(), "4221".to_string()],
            env: BTreeMap::new(),
        };

        let (exe, args) = launch_command("cargo run", &program).unwrap();
        assert_eq!(exe, "cargo");
        assert_eq!(args, vec!["run"]);

        let (exe, args) = launch_command("  ", &program).unwrap();
        assert_eq!(exe, "./server");
        assert_eq!(args, vec!["--port", "4221"]);

        let err = launch_command("", &ProgramConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[tokio::test]
    async fn test_missing_configs_are_input_errors() {
        let runner = runner(Duration::from_secs(1));
        let test = http_test(vec![get("/")]);

        let err = runner.run(None, Some(&server_config(1)), "sleep 5", &test).await.unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));

        let err = runner
            .run(Some(&ProgramConfig::default()), None, "sleep 5", &test)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_response_with_content_length() {
        let port = fake_server("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        let runner = runner(Duration::from_secs(5));

        let result = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(port)),
                "sleep 30",
                &http_test(vec![get("/")]),
            )
            .await
            .unwrap();

        assert_eq!(result.test_name, "http");
        assert_eq!(result.exit_code, 0);
        assert_eq!(
            result.http_responses,
            vec![HttpResponse {
                status_code: 200,
                body: "ok".to_string(),
                headers: BTreeMap::from([("Content-Length".to_string(), "2".to_string())]),
            }]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_content_length_is_classified() {
        let port = fake_server("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nok").await;
        let runner = runner(Duration::from_secs(5));

        let err = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(port)),
                "sleep 30",
                &http_test(vec![get("/")]),
            )
            .await
            .unwrap_err();

        assert_eq!(err.http_failure(), Some(&HttpFailure::MissingContentLength));
        assert!(err.to_string().starts_with("GET /\n"));
        assert!(err.to_string().contains("Content-Length"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_content_response_is_accepted_without_length() {
        let port = fake_server("HTTP/1.1 204 No Content\r\n\r\n").await;
        let runner = runner(Duration::from_secs(5));
        let mut delete = get("/files/a");
        delete.method = "DELETE".to_string();

        let result = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(port)),
                "sleep 30",
                &http_test(vec![delete]),
            )
            .await
            .unwrap();

        assert_eq!(result.http_responses.len(), 1);
        assert_eq!(result.http_responses[0].status_code, 204);
        assert_eq!(result.http_responses[0].body, "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_chunked_response_counts_as_missing_content_length() {
        let port = fake_server(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n",
        )
        .await;
        let runner = runner(Duration::from_secs(5));

        let err = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(port)),
                "sleep 30",
                &http_test(vec![get("/")]),
            )
            .await
            .unwrap_err();

        assert_eq!(err.http_failure(), Some(&HttpFailure::MissingContentLength));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_server_is_a_timeout() {
        let (port, _server) = silent_server().await;
        let runner = runner(Duration::from_millis(300));

        let err = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(port)),
                "sleep 30",
                &http_test(vec![get("/slow")]),
            )
            .await
            .unwrap_err();

        assert_eq!(err.http_failure(), Some(&HttpFailure::ServerTimeout));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nothing_listening_is_a_connection_failure() {
        let port = unused_port().await;
        let runner = runner(Duration::from_secs(5));

        let err = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(port)),
                "sleep 30",
                &http_test(vec![get("/")]),
            )
            .await
            .unwrap_err();

        assert_eq!(err.http_failure(), Some(&HttpFailure::ConnectionFailed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_request_discards_earlier_responses() {
        let good = fake_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let runner = runner(Duration::from_secs(5));

        // The second request carries a method the client refuses to send
        let mut bad = get("/second");
        bad.method = "NOT A METHOD".to_string();

        let err = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(good)),
                "sleep 30",
                &http_test(vec![get("/first"), bad]),
            )
            .await
            .unwrap_err();

        match err {
            EngineError::Http { method, path, failure } => {
                assert_eq!(method, "NOT A METHOD");
                assert_eq!(path, "/second");
                assert!(matches!(failure, HttpFailure::Other(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_that_exits_early_is_reported() {
        let port = unused_port().await;
        let runner = runner(Duration::from_secs(5));

        let err = runner
            .run(
                Some(&ProgramConfig::default()),
                Some(&ServerConfig {
                    port,
                    startup_wait_ms: 300,
                }),
                "false",
                &http_test(vec![get("/")]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ServerExited(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sends_method_headers_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let captured = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 4096];
            // Request head plus the 5-byte body
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&seen);
                if n == 0 || (text.contains("\r\n\r\n") && text.ends_with("hello")) {
                    break;
                }
            }
            socket
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 7\r\nX-Echo: yes\r\n\r\ncreated")
                .await
                .unwrap();
            String::from_utf8_lossy(&seen).into_owned()
        });

        let request = HttpRequest {
            method: "post".to_string(),
            path: "/files/a.txt".to_string(),
            headers: BTreeMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
            body: "hello".to_string(),
        };
        let result = runner(Duration::from_secs(5))
            .run(
                Some(&ProgramConfig::default()),
                Some(&server_config(port)),
                "sleep 30",
                &http_test(vec![request]),
            )
            .await
            .unwrap();

        let raw = captured.await.unwrap();
        assert!(raw.starts_with("POST /files/a.txt HTTP/1.1\r\n"));
        assert!(raw.to_ascii_lowercase().contains("content-type: text/plain"));
        assert!(raw.ends_with("hello"));

        let response = &result.http_responses[0];
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body, "created");
        assert_eq!(response.headers["X-Echo"], "yes");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_server_process_group_is_gone_after_run() {
        use crate::process_tree::tests::wait_until_gone;

        let port = fake_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("worker.pid");
        let script = dir.path().join("server.sh");
        std::fs::write(
            &script,
            format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display()),
        )
        .unwrap();

        let command = format!("sh {}", script.display());
        runner(Duration::from_secs(5))
            .run(
                Some(&ProgramConfig::default()),
                Some(&ServerConfig {
                    port,
                    startup_wait_ms: 300,
                }),
                &command,
                &http_test(vec![get("/")]),
            )
            .await
            .unwrap();

        let worker: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(wait_until_gone(worker, Duration::from_secs(3)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_config_launches_server_with_env_and_releases_port() {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.py");
        std::fs::write(
            &script,
            r#"import http.server, os, sys

class Greeter(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        body = os.environ["GREETING"].encode()
        self.send_response(200)
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)

    def log_message(self, *args):
        pass

http.server.HTTPServer(("127.0.0.1", int(sys.argv[1])), Greeter).serve_forever()
"#,
        )
        .unwrap();

        let port = unused_port().await;
        let program = ProgramConfig {
            executable: "python3".to_string(),
            args: vec![script.display().to_string(), port.to_string()],
            env: BTreeMap::from([("GREETING".to_string(), "hello-env".to_string())]),
        };

        let result = runner(Duration::from_secs(5))
            .run(
                Some(&program),
                Some(&ServerConfig {
                    port,
                    startup_wait_ms: 1000,
                }),
                "",
                &http_test(vec![get("/")]),
            )
            .await
            .unwrap();

        assert_eq!(result.http_responses[0].status_code, 200);
        assert_eq!(result.http_responses[0].body, "hello-env");
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
