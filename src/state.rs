//! Shared gateway state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use toolgrid_mcp::{AgentAcl, ToolCatalog};
use toolgrid_skills::{SkillRegistry, SkillStore};
use tracing::{error, info, warn};

use crate::{
    config::{ConfigError, GatewayConfig},
    prompts::SkillRunner,
    sse::SessionManager,
};

pub const SERVER_NAME: &str = "toolgrid";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
    pub catalog: Arc<ToolCatalog>,
    pub acl: AgentAcl,
    pub skills: Arc<SkillRegistry>,
    pub runner: Arc<SkillRunner>,
    pub sessions: Arc<SessionManager>,
    /// Root cancellation context; every long-lived task derives from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Assemble the gateway from a validated config. Southbound servers
    /// are connected separately via [`AppState::connect_servers`].
    pub fn from_config(config: &GatewayConfig) -> Result<Arc<Self>, ConfigError> {
        let catalog = Arc::new(ToolCatalog::new());
        let acl = AgentAcl::new(config.agents.clone());

        let skills_root = config
            .skills_root
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let skills = Arc::new(SkillRegistry::new(SkillStore::new(skills_root)));
        match skills.refresh() {
            Ok(count) => info!("Loaded {} skill(s)", count),
            Err(err) => warn!("Skill library unavailable: {}", err),
        }

        let runner = Arc::new(SkillRunner::new(
            Arc::clone(&catalog),
            Arc::clone(&skills),
            config.workflow.limits()?,
        ));
        let sessions = Arc::new(SessionManager::new(config.sessions.max_idle()?));

        Ok(Arc::new(Self {
            catalog,
            acl,
            skills,
            runner,
            sessions,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Connect every configured server: initialize, then register.
    ///
    /// Required servers abort startup on failure; optional ones log the
    /// error and are skipped.
    pub async fn connect_servers(&self, config: &GatewayConfig) -> Result<(), ConfigError> {
        for server in &config.servers {
            let client = server.build_client()?;
            match client.initialize(&self.shutdown).await {
                Ok(()) => {
                    if let Err(err) = self.catalog.register(client) {
                        return Err(ConfigError::Invalid(format!(
                            "register '{}': {err}",
                            server.name
                        )));
                    }
                }
                Err(err) if server.required => {
                    return Err(ConfigError::Invalid(format!(
                        "required server '{}' failed to initialize: {}",
                        server.name, err
                    )));
                }
                Err(err) => {
                    error!("Skipping server '{}': {}", server.name, err);
                }
            }
        }
        let stats = self.catalog.stats();
        info!(
            "Catalog ready: {} server(s), {} tool(s)",
            stats.client_count, stats.tool_count
        );
        Ok(())
    }

    /// Optional periodic catalog refresh.
    pub fn spawn_refresh(self: &Arc<Self>, interval: std::time::Duration) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.catalog.refresh_tools(&state.shutdown).await;
                    }
                    _ = state.shutdown.cancelled() => break,
                }
            }
        });
    }
}
