//! Gateway configuration.
//!
//! Loaded from a YAML file: southbound servers (one entry per transport),
//! agent ACLs, workflow limits and session housekeeping. Every section
//! defaults sensibly so a minimal config is just a server list.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolgrid_mcp::{
    catalog::is_valid_name,
    transport::{
        container::{container_client, ContainerTarget},
        http::HttpClient,
        peer::PeerAgentClient,
        process::{CommandSpec, ProcessClient},
        ssh::{ssh_client, SshTarget},
    },
    AgentSelector, ToolClient,
};
use toolgrid_workflow::{parse_duration, ExecutorLimits};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8848";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Southbound tool servers registered at startup.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Agent name -> selector whitelist. Unlisted agents are unrestricted.
    #[serde(default)]
    pub agents: HashMap<String, Vec<AgentSelector>>,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Root of the skill library; skills live under `«root»/skills/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills_root: Option<PathBuf>,

    /// Optional periodic catalog refresh (duration literal). Off when
    /// absent; `tools/list` always serves the cached index either way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<String>,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Whether gateway startup fails when this server cannot be reached.
    /// Optional servers log an error and are skipped.
    #[serde(default)]
    pub required: bool,

    /// Per-server request timeout (duration literal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local child process over stdio.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    /// Remote process over an ssh channel.
    Ssh {
        host: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        identity: Option<PathBuf>,
        command: String,
    },
    /// Process inside a container, attached through the runtime.
    Container {
        container: String,
        command: Vec<String>,
        #[serde(default = "default_runtime")]
        runtime: String,
    },
    /// Plain HTTP POST endpoint.
    Http {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
    /// Peer-agent protocol adapter.
    Peer { url: String },
}

fn default_runtime() -> String {
    toolgrid_mcp::transport::container::DEFAULT_RUNTIME.to_string()
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Result<Duration, ConfigError> {
        match &self.request_timeout {
            Some(literal) => parse_duration(literal)
                .map_err(|err| ConfigError::Invalid(format!("server '{}': {err}", self.name))),
            None => Ok(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Build the transport client for this entry.
    pub fn build_client(&self) -> Result<Arc<dyn ToolClient>, ConfigError> {
        let timeout = self.request_timeout()?;
        let client: Arc<dyn ToolClient> = match &self.transport {
            TransportConfig::Process {
                command,
                args,
                envs,
            } => Arc::new(ProcessClient::new(
                &self.name,
                CommandSpec::new(command)
                    .with_args(args.clone())
                    .with_envs(envs.clone()),
                timeout,
            )),
            TransportConfig::Ssh {
                host,
                user,
                port,
                identity,
                command,
            } => Arc::new(ssh_client(
                &self.name,
                &SshTarget {
                    host: host.clone(),
                    user: user.clone(),
                    port: *port,
                    identity: identity.clone(),
                    command: command.clone(),
                },
                timeout,
            )),
            TransportConfig::Container {
                container,
                command,
                runtime,
            } => Arc::new(container_client(
                &self.name,
                &ContainerTarget::new(container, command.clone()).with_runtime(runtime),
                timeout,
            )),
            TransportConfig::Http { url, token } => Arc::new(
                HttpClient::new(&self.name, url, token.as_deref(), timeout)
                    .map_err(|err| ConfigError::Invalid(format!("server '{}': {err}", self.name)))?,
            ),
            TransportConfig::Peer { url } => Arc::new(
                PeerAgentClient::new(&self.name, url, timeout)
                    .map_err(|err| ConfigError::Invalid(format!("server '{}': {err}", self.name)))?,
            ),
        };
        Ok(client)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Wall-time bound per workflow (duration literal).
    #[serde(default = "default_deadline")]
    pub deadline: String,
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_depth() -> usize {
    5
}

fn default_deadline() -> String {
    "10m".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_depth: default_max_depth(),
            deadline: default_deadline(),
        }
    }
}

impl WorkflowConfig {
    pub fn limits(&self) -> Result<ExecutorLimits, ConfigError> {
        Ok(ExecutorLimits {
            max_parallel: self.max_parallel.max(1),
            max_depth: self.max_depth.max(1),
            deadline: parse_duration(&self.deadline)
                .map_err(|err| ConfigError::Invalid(format!("workflow.deadline: {err}")))?,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionsConfig {
    /// Sessions idle past this are swept (duration literal).
    #[serde(default = "default_max_idle")]
    pub max_idle: String,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
}

fn default_max_idle() -> String {
    "30m".to_string()
}

fn default_sweep_interval() -> String {
    "60s".to_string()
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl SessionsConfig {
    pub fn max_idle(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.max_idle)
            .map_err(|err| ConfigError::Invalid(format!("sessions.max_idle: {err}")))
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.sweep_interval)
            .map_err(|err| ConfigError::Invalid(format!("sessions.sweep_interval: {err}")))
    }
}

/// Load and validate a config file.
pub fn load_config(path: &std::path::Path) -> Result<GatewayConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: GatewayConfig = serde_yaml::from_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for server in &config.servers {
        if !is_valid_name(&server.name) {
            return Err(ConfigError::Invalid(format!(
                "server name '{}' must match [A-Za-z0-9_-]+",
                server.name
            )));
        }
        if !seen.insert(server.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate server name '{}'",
                server.name
            )));
        }
        server.request_timeout()?;
    }
    for (agent, selectors) in &config.agents {
        if agent.is_empty() {
            return Err(ConfigError::Invalid("agent name must be non-empty".to_string()));
        }
        for selector in selectors {
            if !is_valid_name(&selector.server) {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}': selector server '{}' must match [A-Za-z0-9_-]+",
                    agent, selector.server
                )));
            }
        }
    }
    config.workflow.limits()?;
    config.sessions.max_idle()?;
    config.sessions.sweep_interval()?;
    if let Some(interval) = &config.refresh_interval {
        parse_duration(interval)
            .map_err(|err| ConfigError::Invalid(format!("refresh_interval: {err}")))?;
    }
    Ok(())
}
