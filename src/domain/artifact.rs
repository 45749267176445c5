//! Artifacts produced by workflow stages.
//!
//! Artifacts are the named outputs of stages that later stages consume as inputs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named artifacts of a run, ordered by name
pub type Artifacts = BTreeMap<String, Artifact>;

/// An artifact produced by a workflow stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact name (unique within a run)
    pub name: String,

    /// Index of the stage that produced this artifact
    pub stage_index: usize,

    /// Agent name, or "approval" for gate outputs
    pub produced_by: String,

    /// Artifact payload
    pub content: Value,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// Serialized size in bytes (for tracking)
    pub size_bytes: u64,
}

impl Artifact {
    /// Create a new artifact
    pub fn new(
        name: impl Into<String>,
        stage_index: usize,
        produced_by: impl Into<String>,
        content: Value,
    ) -> Self {
        let size_bytes = serde_json::to_vec(&content)
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        Self {
            name: name.into(),
            stage_index,
            produced_by: produced_by.into(),
            content,
            created_at: Utc::now(),
            size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_artifact_creation() {
        let artifact = Artifact::new("research_notes", 0, "researcher", json!("hello"));

        assert_eq!(artifact.name, "research_notes");
        assert_eq!(artifact.produced_by, "researcher");
        assert_eq!(artifact.size_bytes, 7);
    }

    #[test]
    fn test_artifact_serialization() {
        let artifact = Artifact::new("calendar", 2, "planner", json!({"weeks": 4}));

        let json = serde_json::to_string(&artifact).unwrap();
        let parsed: Artifact = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, artifact);
    }
}
