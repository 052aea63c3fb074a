//! Skill domain types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use toolgrid_workflow::{InputSpec, OutputSpec, WorkflowStep};

/// Lifecycle state of a skill. Only `active` skills are served as prompts
/// and tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SkillState {
    #[default]
    Draft,
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Markdown body following the frontmatter.
    #[serde(skip)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub state: SkillState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflow: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
    #[serde(rename = "allowed-tools", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

impl Skill {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            body: String::new(),
            tags: Vec::new(),
            state: SkillState::default(),
            inputs: BTreeMap::new(),
            workflow: Vec::new(),
            output: None,
            allowed_tools: Vec::new(),
        }
    }

    /// A skill with a workflow can be called as a tool.
    pub fn is_executable(&self) -> bool {
        !self.workflow.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.state == SkillState::Active
    }
}

/// Skill names share the tool-name grammar.
pub fn is_valid_skill_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executable_iff_workflow_non_empty() {
        let mut skill = Skill::new("greeter", "Greets people");
        assert!(!skill.is_executable());
        skill.workflow.push(WorkflowStep::new("a", "echo"));
        assert!(skill.is_executable());
    }

    #[test]
    fn name_grammar() {
        assert!(is_valid_skill_name("daily-report_v2"));
        assert!(!is_valid_skill_name(""));
        assert!(!is_valid_skill_name("bad name"));
        assert!(!is_valid_skill_name("bad/name"));
    }

    #[test]
    fn state_defaults_to_draft() {
        let skill: Skill = serde_yaml::from_str("name: x\ndescription: y\n").unwrap();
        assert_eq!(skill.state, SkillState::Draft);
        assert!(!skill.is_active());
    }
}
