//! Container-attach transport.
//!
//! Reaches a tool server running inside an already-provisioned container
//! by attaching through the container runtime (`docker exec -i` or a
//! compatible runtime such as podman). The attached process's stdio then
//! carries the same newline-delimited JSON-RPC as a local child.

use std::time::Duration;

use super::process::{CommandSpec, ProcessClient};

pub const DEFAULT_RUNTIME: &str = "docker";

#[derive(Debug, Clone)]
pub struct ContainerTarget {
    /// Container name or id known to the runtime.
    pub container: String,
    /// Command started inside the container; must speak JSON-RPC on stdio.
    pub command: Vec<String>,
    /// Runtime binary, `docker` by default.
    pub runtime: String,
}

impl ContainerTarget {
    pub fn new(container: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            container: container.into(),
            command,
            runtime: DEFAULT_RUNTIME.to_string(),
        }
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = vec!["exec".to_string(), "-i".to_string(), self.container.clone()];
        argv.extend(self.command.iter().cloned());
        argv
    }
}

/// Build a pipe-style client attached through the container runtime.
pub fn container_client(
    name: impl Into<String>,
    target: &ContainerTarget,
    request_timeout: Duration,
) -> ProcessClient {
    let spec = CommandSpec::new(&target.runtime).with_args(target.argv());
    ProcessClient::new(name, spec, request_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_attaches_interactively() {
        let target = ContainerTarget::new(
            "tools-1",
            vec!["python".to_string(), "-m".to_string(), "server".to_string()],
        );
        assert_eq!(target.argv(), vec!["exec", "-i", "tools-1", "python", "-m", "server"]);
        assert_eq!(target.runtime, "docker");
    }

    #[test]
    fn runtime_is_overridable() {
        let target =
            ContainerTarget::new("tools-1", vec!["server".to_string()]).with_runtime("podman");
        assert_eq!(target.runtime, "podman");
    }
}
