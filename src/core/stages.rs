//! Workflow definitions and loading.
//!
//! A workflow is an ordered list of stages defined in YAML. Each stage is
//! executed either by a named agent or by the approval gate, and declares
//! the artifacts it reads and writes:
//!
//! ```yaml
//! name: campaign-calendar
//! stages:
//!   - name: research
//!     agent: researcher
//!     inputs: [params]
//!     outputs: [research_brief]
//!   - name: strategy_review
//!     approval:
//!       summary_from: research_brief
//!       revise_to: research
//!     outputs: [review]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agents::AgentRegistry;
use crate::config::ExecutionSettings;

use super::executor::Budget;

/// Input name that resolves to the run's start parameters
pub const PARAMS_INPUT: &str = "params";

/// Producer recorded on artifacts written by approval stages
pub const APPROVAL_PRODUCER: &str = "approval";

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Ordered list of stages to execute
    pub stages: Vec<Stage>,
}

impl Workflow {
    /// Load a workflow from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a workflow from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Validate the stage graph
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Workflow name cannot be empty");
        }

        if self.stages.is_empty() {
            anyhow::bail!("Workflow must have at least one stage");
        }

        let mut names = HashSet::new();
        let mut available: HashSet<&str> = HashSet::from([PARAMS_INPUT]);

        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                anyhow::bail!("Stage {} has an empty name", i);
            }
            if !names.insert(stage.name.as_str()) {
                anyhow::bail!("Duplicate stage name '{}'", stage.name);
            }

            match (&stage.agent, &stage.approval) {
                (Some(_), Some(_)) => anyhow::bail!(
                    "Stage '{}' declares both an agent and an approval block",
                    stage.name
                ),
                (None, None) => anyhow::bail!(
                    "Stage '{}' declares neither an agent nor an approval block",
                    stage.name
                ),
                _ => {}
            }

            for input in &stage.inputs {
                if !available.contains(input.as_str()) {
                    anyhow::bail!(
                        "Stage '{}' reads '{}', which no earlier stage produces",
                        stage.name,
                        input
                    );
                }
            }

            if let Some(approval) = &stage.approval {
                if let Some(source) = &approval.summary_from {
                    if !available.contains(source.as_str()) {
                        anyhow::bail!(
                            "Approval stage '{}' summarizes '{}', which no earlier stage produces",
                            stage.name,
                            source
                        );
                    }
                }

                if let Some(target) = &approval.revise_to {
                    match self.stage_index(target) {
                        Some(idx) if idx < i => {}
                        Some(_) => anyhow::bail!(
                            "Approval stage '{}' can only revise to an earlier stage, not '{}'",
                            stage.name,
                            target
                        ),
                        None => anyhow::bail!(
                            "Approval stage '{}' revises to unknown stage '{}'",
                            stage.name,
                            target
                        ),
                    }
                }

                if stage.outputs.len() > 1 {
                    anyhow::bail!(
                        "Approval stage '{}' may declare at most one output",
                        stage.name
                    );
                }
            }

            for output in &stage.outputs {
                if output == PARAMS_INPUT {
                    anyhow::bail!("Stage '{}' cannot write the reserved '{}'", stage.name, PARAMS_INPUT);
                }
                if !available.insert(output.as_str()) {
                    anyhow::bail!(
                        "Stage '{}' writes '{}', which is already produced earlier",
                        stage.name,
                        output
                    );
                }
            }
        }

        Ok(())
    }

    /// Check that every agent stage names a registered agent
    pub fn validate_agents(&self, agents: &AgentRegistry) -> Result<()> {
        for stage in &self.stages {
            if let Some(agent) = &stage.agent {
                if !agents.contains(agent) {
                    anyhow::bail!(
                        "Stage '{}' uses unknown agent '{}' (registered: {})",
                        stage.name,
                        agent,
                        agents.names().join(", ")
                    );
                }
            }
        }
        Ok(())
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Default revise target of the approval stage at `index`
    pub fn revise_target(&self, index: usize) -> Option<usize> {
        let target = self.stages.get(index)?.approval.as_ref()?.revise_to.as_ref()?;
        self.stage_index(target)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// A single stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (unique within the workflow)
    pub name: String,

    /// Agent executing this stage
    #[serde(default)]
    pub agent: Option<String>,

    /// Present on approval stages
    #[serde(default)]
    pub approval: Option<ApprovalStage>,

    /// Artifact names read by this stage (`params` = run parameters)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Artifact names this stage must produce
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Override the per-attempt timeout
    pub timeout_seconds: Option<u64>,

    /// Override the retry count
    pub max_retries: Option<u32>,

    /// Override the tool-call budget
    pub max_tool_calls: Option<u32>,
}

/// Approval stage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalStage {
    /// Artifact rendered as the reviewer summary
    #[serde(default)]
    pub summary_from: Option<String>,

    /// Stage name to resume at on `revise` when the reviewer names none
    #[serde(default)]
    pub revise_to: Option<String>,
}

/// What executes a stage
#[derive(Debug, Clone, Copy)]
pub enum StageKind<'a> {
    Agent(&'a str),
    Approval(&'a ApprovalStage),
}

impl Stage {
    pub fn kind(&self) -> StageKind<'_> {
        match (&self.agent, &self.approval) {
            (Some(agent), _) => StageKind::Agent(agent),
            (None, Some(approval)) => StageKind::Approval(approval),
            // Rejected by validation
            (None, None) => StageKind::Approval(&DEFAULT_APPROVAL),
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self.kind(), StageKind::Approval(_))
    }

    /// Effective budget with stage overrides applied
    pub fn budget(&self, defaults: &ExecutionSettings) -> Budget {
        Budget {
            timeout: Duration::from_secs(self.timeout_seconds.unwrap_or(defaults.timeout_seconds)),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            max_tool_calls: self.max_tool_calls.unwrap_or(defaults.max_tool_calls),
        }
    }
}

static DEFAULT_APPROVAL: ApprovalStage = ApprovalStage {
    summary_from: None,
    revise_to: None,
};

#[cfg(test)]
mod tests {
    use super::*;

    const CAMPAIGN: &str = r#"
name: campaign-calendar
description: Monthly email calendar
stages:
  - name: research
    agent: researcher
    inputs: [params]
    outputs: [research_brief]
  - name: strategy_review
    approval:
      summary_from: research_brief
      revise_to: research
    outputs: [review]
  - name: calendar
    agent: planner
    inputs: [params, research_brief]
    outputs: [calendar]
    max_retries: 1
  - name: copy
    agent: copywriter
    inputs: [calendar]
    outputs: [email_copy]
    timeout_seconds: 30
"#;

    #[test]
    fn test_workflow_parsing() {
        let workflow = Workflow::from_yaml(CAMPAIGN).unwrap();
        assert_eq!(workflow.name, "campaign-calendar");
        assert_eq!(workflow.len(), 4);
        assert!(workflow.stages[1].is_approval());
        assert_eq!(workflow.revise_target(1), Some(0));
        workflow.validate().unwrap();
    }

    #[test]
    fn test_budget_overrides() {
        let workflow = Workflow::from_yaml(CAMPAIGN).unwrap();
        let defaults = ExecutionSettings::default();

        let calendar = workflow.stages[2].budget(&defaults);
        assert_eq!(calendar.max_retries, 1);
        assert_eq!(calendar.timeout, Duration::from_secs(300));

        let copy = workflow.stages[3].budget(&defaults);
        assert_eq!(copy.timeout, Duration::from_secs(30));
        assert_eq!(copy.max_retries, 3);
    }

    #[test]
    fn test_input_must_be_produced_earlier() {
        let yaml = r#"
name: broken
stages:
  - name: copy
    agent: copywriter
    inputs: [calendar]
    outputs: [email_copy]
  - name: calendar
    agent: planner
    outputs: [calendar]
"#;
        let err = Workflow::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("no earlier stage produces"));
    }

    #[test]
    fn test_revise_target_must_be_earlier() {
        let yaml = r#"
name: broken
stages:
  - name: review
    approval:
      revise_to: draft
  - name: draft
    agent: writer
"#;
        let err = Workflow::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("earlier stage"));
    }

    #[test]
    fn test_stage_needs_exactly_one_executor() {
        let yaml = r#"
name: broken
stages:
  - name: nothing
"#;
        assert!(Workflow::from_yaml(yaml).unwrap().validate().is_err());
    }

    #[test]
    fn test_duplicate_outputs_rejected() {
        let yaml = r#"
name: broken
stages:
  - name: a
    agent: x
    outputs: [draft]
  - name: b
    agent: y
    outputs: [draft]
"#;
        let err = Workflow::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("already produced"));
    }

    #[test]
    fn test_unknown_agent_detected() {
        let workflow = Workflow::from_yaml(CAMPAIGN).unwrap();
        let err = workflow.validate_agents(&AgentRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("unknown agent 'researcher'"));
    }
}
