//! Agent-scoped access control.
//!
//! An ACL binds an agent name to a list of selectors, each naming a server
//! and a set of tool globs. Agents without a binding see everything; a
//! bound agent sees exactly the union of its selectors. Denials surface as
//! tool results with `is_error = true`, never as protocol errors, so the
//! façade can hand them to the model like any other tool failure.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{catalog::split_name, protocol::Tool};

/// One whitelist entry: a server plus tool globs.
///
/// An empty `tools` list allows every tool of the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSelector {
    pub server: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentSelector {
    pub fn matches(&self, server: &str, tool: &str) -> bool {
        if self.server != server {
            return false;
        }
        self.tools.is_empty() || self.tools.iter().any(|glob| glob_match(glob, tool))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentAcl {
    agents: HashMap<String, Vec<AgentSelector>>,
}

impl AgentAcl {
    pub fn new(agents: HashMap<String, Vec<AgentSelector>>) -> Self {
        Self { agents }
    }

    /// True when the agent may call `server`'s unprefixed `tool`.
    ///
    /// Unknown agents and agents with an empty selector list are
    /// unrestricted.
    pub fn allows(&self, agent: &str, server: &str, tool: &str) -> bool {
        match self.agents.get(agent) {
            None => true,
            Some(selectors) if selectors.is_empty() => true,
            Some(selectors) => selectors
                .iter()
                .any(|selector| selector.matches(server, tool)),
        }
    }

    /// Convenience form over a prefixed catalog name.
    pub fn allows_prefixed(&self, agent: &str, prefixed: &str) -> bool {
        match split_name(prefixed) {
            Some((server, tool)) => self.allows(agent, server, tool),
            None => false,
        }
    }

    /// Filter a prefixed catalog listing down to the agent's view.
    pub fn filter_tools(&self, agent: &str, tools: Vec<Tool>) -> Vec<Tool> {
        if !self.is_restricted(agent) {
            return tools;
        }
        tools
            .into_iter()
            .filter(|tool| self.allows_prefixed(agent, &tool.name))
            .collect()
    }

    pub fn is_restricted(&self, agent: &str) -> bool {
        self.agents
            .get(agent)
            .map(|selectors| !selectors.is_empty())
            .unwrap_or(false)
    }
}

/// Small glob matcher: `*` matches zero or more characters, `?` exactly
/// one, everything else is a case-sensitive literal. Iterative with
/// single-star backtracking.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(server: &str, tools: &[&str]) -> AgentSelector {
        AgentSelector {
            server: server.to_string(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn glob_literal_and_wildcards() {
        assert!(glob_match("read", "read"));
        assert!(!glob_match("read", "reads"));
        assert!(glob_match("read*", "read_file"));
        assert!(glob_match("*_file", "read_file"));
        assert!(glob_match("r?ad", "read"));
        assert!(!glob_match("r?ad", "rread"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "a__b__c"));
        assert!(!glob_match("a*b*c", "a__b__d"));
        // Case-sensitive literals.
        assert!(!glob_match("Read", "read"));
    }

    #[test]
    fn unknown_agent_is_unrestricted() {
        let acl = AgentAcl::default();
        assert!(acl.allows("anyone", "files", "read"));
        assert!(!acl.is_restricted("anyone"));
    }

    #[test]
    fn empty_selector_list_is_unrestricted() {
        let acl = AgentAcl::new(HashMap::from([("bot".to_string(), vec![])]));
        assert!(acl.allows("bot", "files", "read"));
    }

    #[test]
    fn empty_tool_globs_allow_whole_server() {
        let acl = AgentAcl::new(HashMap::from([(
            "bot".to_string(),
            vec![selector("files", &[])],
        )]));
        assert!(acl.allows("bot", "files", "read"));
        assert!(acl.allows("bot", "files", "write"));
        assert!(!acl.allows("bot", "web", "search"));
    }

    #[test]
    fn selectors_are_additive() {
        let acl = AgentAcl::new(HashMap::from([(
            "bot".to_string(),
            vec![selector("files", &["read*"]), selector("web", &["search"])],
        )]));
        assert!(acl.allows("bot", "files", "read_file"));
        assert!(!acl.allows("bot", "files", "write_file"));
        assert!(acl.allows("bot", "web", "search"));
        assert!(!acl.allows("bot", "web", "fetch"));
    }

    #[test]
    fn filter_tools_intersects_catalog_with_selectors() {
        let acl = AgentAcl::new(HashMap::from([(
            "filtered".to_string(),
            vec![selector("server1", &["allowed"])],
        )]));
        let tools = vec![
            Tool::new("server1__allowed"),
            Tool::new("server1__denied"),
            Tool::new("server2__other"),
        ];
        let visible: Vec<String> = acl
            .filter_tools("filtered", tools.clone())
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(visible, vec!["server1__allowed"]);

        // The unrestricted view is untouched.
        assert_eq!(acl.filter_tools("other", tools).len(), 3);
    }
}
