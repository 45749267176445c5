//! Agent backed by an external command.
//!
//! The command receives `{"inputs": {...}, "context": {...}}` as JSON on
//! stdin and must print `{"outputs": {...}, "tool_calls": [...]}` on
//! stdout. Exit codes follow sysexits:
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 65 | invalid input |
//! | 69 | network / service unavailable (retried) |
//! | 75 | temporary failure (retried) |
//! | 77 | policy violation |
//! | other | failed |

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Agent, AgentError, InvocationContext, Inputs, Outputs};
use crate::config::AgentSpec;

const EX_DATAERR: i32 = 65;
const EX_UNAVAILABLE: i32 = 69;
const EX_TEMPFAIL: i32 = 75;
const EX_NOPERM: i32 = 77;

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    outputs: Outputs,
    /// Tools the command used, charged against the budget
    #[serde(default)]
    tool_calls: Vec<String>,
}

pub struct CommandAgent {
    name: String,
    spec: AgentSpec,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, spec: AgentSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    fn classify_exit(code: Option<i32>, stderr: &str) -> AgentError {
        let detail = if stderr.is_empty() {
            format!("exit code {}", code.unwrap_or(-1))
        } else {
            format!("exit code {}: {}", code.unwrap_or(-1), stderr)
        };

        match code {
            Some(EX_DATAERR) => AgentError::InvalidInput(detail),
            Some(EX_UNAVAILABLE) => AgentError::Network(detail),
            Some(EX_TEMPFAIL) => AgentError::Timeout(detail),
            Some(EX_NOPERM) => AgentError::PolicyViolation(detail),
            _ => AgentError::Failed(detail),
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, inputs: &Inputs, ctx: &InvocationContext) -> Result<Outputs, AgentError> {
        let request = json!({
            "inputs": inputs,
            "context": {
                "run_id": ctx.run_id,
                "stage_index": ctx.stage_index,
                "stage": ctx.stage_name,
                "attempt": ctx.attempt,
                "invocation_key": ctx.invocation_key,
                "max_tool_calls": ctx.max_tool_calls(),
            }
        });
        let payload = serde_json::to_vec(&request)
            .map_err(|e| AgentError::InvalidInput(format!("inputs are not serializable: {}", e)))?;

        // Dropping the future (timeout, abort) kills the child
        let mut child = Command::new(&self.spec.command)
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .env("STAGECOACH_INVOCATION_KEY", &ctx.invocation_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::Failed(format!(
                    "failed to spawn '{}' for agent '{}': {}",
                    self.spec.command, self.name, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| AgentError::Failed(format!("failed to write agent stdin: {}", e)))?;
            // Drop stdin to signal EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AgentError::Failed(format!("failed to wait for agent: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::classify_exit(output.status.code(), stderr.trim()));
        }

        let response: CommandResponse = serde_json::from_slice(&output.stdout).map_err(|e| {
            AgentError::Failed(format!("agent '{}' printed malformed output: {}", self.name, e))
        })?;

        for tool in &response.tool_calls {
            ctx.use_tool(tool)?;
        }

        Ok(response.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn shell_agent(script: &str) -> CommandAgent {
        CommandAgent::new(
            "shell",
            AgentSpec {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: BTreeMap::new(),
            },
        )
    }

    fn context(max_tool_calls: u32) -> InvocationContext {
        InvocationContext::new(
            Uuid::new_v4(),
            1,
            "draft",
            1,
            "0123456789abcdef",
            max_tool_calls,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_exit_code_mapping() {
        assert!(matches!(
            CommandAgent::classify_exit(Some(65), ""),
            AgentError::InvalidInput(_)
        ));
        assert!(CommandAgent::classify_exit(Some(69), "").is_retryable());
        assert!(CommandAgent::classify_exit(Some(75), "").is_retryable());
        assert!(matches!(
            CommandAgent::classify_exit(Some(77), "denied"),
            AgentError::PolicyViolation(_)
        ));
        assert!(matches!(
            CommandAgent::classify_exit(None, ""),
            AgentError::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_outputs_parsed_from_stdout() {
        let agent = shell_agent(r#"cat >/dev/null; echo '{"outputs": {"draft": "hello"}}'"#);

        let outputs = agent.invoke(&Inputs::new(), &context(5)).await.unwrap();
        assert_eq!(outputs["draft"], "hello");
    }

    #[tokio::test]
    async fn test_receives_invocation_key() {
        let agent = shell_agent(
            r#"cat >/dev/null; printf '{"outputs": {"key": "%s"}}' "$STAGECOACH_INVOCATION_KEY""#,
        );

        let outputs = agent.invoke(&Inputs::new(), &context(5)).await.unwrap();
        assert_eq!(outputs["key"], "0123456789abcdef");
    }

    #[tokio::test]
    async fn test_tool_calls_charged_against_budget() {
        let agent = shell_agent(
            r#"cat >/dev/null; echo '{"outputs": {}, "tool_calls": ["search", "search", "fetch"]}'"#,
        );

        let err = agent.invoke(&Inputs::new(), &context(2)).await.unwrap_err();
        assert_eq!(err, AgentError::ToolBudgetExhausted { limit: 2 });
    }

    #[tokio::test]
    async fn test_tempfail_is_retryable() {
        let agent = shell_agent("cat >/dev/null; echo 'upstream busy' >&2; exit 75");

        let err = agent.invoke(&Inputs::new(), &context(5)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("upstream busy"));
    }
}
