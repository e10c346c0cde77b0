// Cascaded suite wire format
use crate::types::{null_as_default, ProgramConfig, ServerConfig, Stage, Test, TestSuite, TestType};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Test definitions for stages 1..X when stage X is requested
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadedTestConfig {
    pub target_stage_uuid: Uuid,
    pub target_stage_number: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stages_to_run: Vec<StageTestInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTestInfo {
    pub stage_uuid: Uuid,
    pub stage_number: u32,
    pub stage_name: String,
    /// JSON document of type [`StageTestConfig`], embedded as a string
    pub test_config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTestConfig {
    #[serde(default)]
    pub stage_name: String,
    #[serde(default)]
    pub test_type: TestType,
    #[serde(default)]
    pub program_config: Option<ProgramConfig>,
    #[serde(default)]
    pub server_config: Option<ServerConfig>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tests: Vec<Test>,
}

impl StageTestInfo {
    /// Decode the embedded test config into a [`Stage`]
    pub fn parse(&self) -> Result<Stage> {
        let config: StageTestConfig = serde_json::from_str(&self.test_config)
            .with_context(|| format!("Failed to parse tests for stage {}", self.stage_number))?;

        Ok(Stage {
            id: self.stage_uuid,
            number: self.stage_number,
            name: self.stage_name.clone(),
            test_type: config.test_type,
            program_config: config.program_config,
            server_config: config.server_config,
            tests: config.tests,
        })
    }
}

impl CascadedTestConfig {
    /// Parse every stage up front so the suite is immutable once running
    pub fn into_suite(self) -> Result<TestSuite> {
        let stages = self
            .stages_to_run
            .iter()
            .map(StageTestInfo::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(TestSuite {
            target_stage_id: self.target_stage_uuid,
            target_stage_number: self.target_stage_number,
            stages,
        })
    }
}

/// Parse a cascaded suite document
pub fn parse_suite(json: &str) -> Result<TestSuite> {
    let cascaded: CascadedTestConfig =
        serde_json::from_str(json).context("Failed to parse cascaded test config")?;
    cascaded.into_suite()
}

/// Load a cascaded suite document from disk
pub fn load_suite(path: &Path) -> Result<TestSuite> {
    if !path.exists() {
        bail!("Test suite file not found: {}", path.display());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    parse_suite(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_json(number: u32, config: &str) -> serde_json::Value {
        serde_json::json!({
            "stageUuid": Uuid::new_v4(),
            "stageNumber": number,
            "stageName": format!("stage {}", number),
            "testConfig": config,
        })
    }

    #[test]
    fn test_parse_cascaded_suite() {
        let cli = r#"{"stageName":"echo","testType":"cli_interactive","tests":[
            {"testName":"hello","stdin":"hello\n","timeoutSeconds":5}
        ]}"#;
        let http = r#"{"stageName":"server","testType":"http_server",
            "programConfig":{"executable":"./server","args":null,"env":{"MODE":"test"}},
            "serverConfig":{"port":4221,"startupWaitMs":500},
            "tests":[{"testName":"root","httpRequests":[{"method":"GET","path":"/"}]}]}"#;

        let doc = serde_json::json!({
            "targetStageUuid": Uuid::new_v4(),
            "targetStageNumber": 2,
            "stagesToRun": [stage_json(1, cli), stage_json(2, http)],
        });

        let suite = parse_suite(&doc.to_string()).unwrap();

        assert_eq!(suite.target_stage_number, 2);
        assert_eq!(suite.stages.len(), 2);
        assert_eq!(suite.total_tests(), 2);

        let first = &suite.stages[0];
        assert_eq!(first.test_type, TestType::CliInteractive);
        assert_eq!(first.tests[0].stdin, "hello\n");
        assert!(first.server_config.is_none());

        let second = &suite.stages[1];
        assert_eq!(second.test_type, TestType::HttpServer);
        let server = second.server_config.as_ref().unwrap();
        assert_eq!(server.port, 4221);
        assert_eq!(server.startup_wait_ms, 500);
        let program = second.program_config.as_ref().unwrap();
        assert!(program.args.is_empty());
        assert_eq!(program.env["MODE"], "test");
        assert_eq!(second.tests[0].http_requests[0].path, "/");
    }

    #[test]
    fn test_bad_stage_config_names_stage_number() {
        let doc = serde_json::json!({
            "targetStageUuid": Uuid::new_v4(),
            "targetStageNumber": 3,
            "stagesToRun": [stage_json(3, "{not json")],
        });

        let err = parse_suite(&doc.to_string()).unwrap_err();

        assert!(format!("{:#}", err).contains("stage 3"));
    }

    #[test]
    fn test_load_suite_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_suite(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
