//! Aggregated tool catalog and call router.
//!
//! The catalog owns every registered southbound client and a flat index
//! from prefixed tool name (`«server»__«tool»`) to the owning client.
//! Lookups take a read lock; registration, removal and index rebuilds take
//! the write lock briefly and never across a network call.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{McpError, McpResult},
    protocol::{CallToolResult, Tool},
    transport::ToolClient,
};

/// Separator between the server prefix and the tool name.
pub const NAME_SEPARATOR: &str = "__";

/// Server and tool names share one grammar.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Compose the prefixed catalog name.
pub fn compose_name(server: &str, tool: &str) -> String {
    format!("{server}{NAME_SEPARATOR}{tool}")
}

/// Split a prefixed name at the first `__`.
pub fn split_name(prefixed: &str) -> Option<(&str, &str)> {
    let (server, tool) = prefixed.split_once(NAME_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

#[derive(Debug, Clone, Default)]
pub struct CatalogStats {
    pub client_count: usize,
    pub tool_count: usize,
}

#[derive(Default)]
pub struct ToolCatalog {
    clients: RwLock<HashMap<String, Arc<dyn ToolClient>>>,
    /// prefixed tool name -> owning client name
    index: RwLock<HashMap<String, String>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and index its cached tools.
    pub fn register(&self, client: Arc<dyn ToolClient>) -> McpResult<()> {
        let name = client.name().to_string();
        if !is_valid_name(&name) {
            return Err(McpError::InvalidName(name));
        }
        if self.clients.read().contains_key(&name) {
            return Err(McpError::InvalidName(format!(
                "server '{name}' already registered"
            )));
        }
        self.clients.write().insert(name.clone(), client);
        self.rebuild_index();
        info!("Registered server '{}'", name);
        Ok(())
    }

    /// Remove a client from the catalog, returning it so the caller can
    /// close it outside the lock.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        let removed = self.clients.write().remove(name);
        if removed.is_some() {
            self.rebuild_index();
            info!("Removed server '{}'", name);
        }
        removed
    }

    pub fn client(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        self.clients.read().get(name).map(Arc::clone)
    }

    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Rebuild the flat name index from every client's cached tool list.
    ///
    /// Tools whose names fall outside the grammar are skipped with a
    /// warning rather than poisoning the index.
    fn rebuild_index(&self) {
        let clients: Vec<(String, Arc<dyn ToolClient>)> = self
            .clients
            .read()
            .iter()
            .map(|(name, client)| (name.clone(), Arc::clone(client)))
            .collect();

        let mut index = HashMap::new();
        for (server, client) in clients {
            for tool in client.tools() {
                if !is_valid_name(&tool.name) {
                    warn!(
                        "Skipping tool '{}' from '{}': invalid name",
                        tool.name, server
                    );
                    continue;
                }
                index.insert(compose_name(&server, &tool.name), server.clone());
            }
        }
        let count = index.len();
        *self.index.write() = index;
        debug!("Catalog index rebuilt: {} tool(s)", count);
    }

    /// Ask every client to refresh, then rebuild the index.
    ///
    /// A client that fails to refresh keeps its cached list; the rebuild
    /// still runs so removals elsewhere are observed.
    pub async fn refresh_tools(&self, cancel: &CancellationToken) {
        let clients: Vec<Arc<dyn ToolClient>> =
            self.clients.read().values().map(Arc::clone).collect();
        for client in clients {
            if let Err(err) = client.refresh_tools(cancel).await {
                warn!("Refresh failed for '{}': {}", client.name(), err);
            }
        }
        self.rebuild_index();
    }

    /// The aggregated catalog with prefixed names.
    pub fn list_tools(&self) -> Vec<Tool> {
        let clients: Vec<(String, Arc<dyn ToolClient>)> = self
            .clients
            .read()
            .iter()
            .map(|(name, client)| (name.clone(), Arc::clone(client)))
            .collect();

        let mut tools = Vec::new();
        for (server, client) in clients {
            for mut tool in client.tools() {
                if !is_valid_name(&tool.name) {
                    continue;
                }
                tool.name = compose_name(&server, &tool.name);
                tools.push(tool);
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Route a call to the owning client with the unprefixed name.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        prefixed: &str,
        args: Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        let (_, tool) = split_name(prefixed)
            .ok_or_else(|| McpError::ToolNotFound(prefixed.to_string()))?;
        let server = self
            .index
            .read()
            .get(prefixed)
            .cloned()
            .ok_or_else(|| McpError::ToolNotFound(prefixed.to_string()))?;
        let client = self
            .client(&server)
            .ok_or_else(|| McpError::ServerNotFound(server.clone()))?;
        client.call_tool(cancel, tool, args).await
    }

    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            client_count: self.clients.read().len(),
            tool_count: self.index.read().len(),
        }
    }

    /// Close every client and empty the catalog.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<dyn ToolClient>> = {
            let mut clients = self.clients.write();
            self.index.write().clear();
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.close().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::transport::ClientState;

    /// In-memory client used across catalog and ACL tests.
    pub(crate) struct StaticClient {
        pub name: String,
        pub tools: Vec<Tool>,
        pub calls: Mutex<Vec<String>>,
        pub fail_refresh: bool,
    }

    impl StaticClient {
        pub fn new(name: &str, tool_names: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                tools: tool_names.iter().map(|name| Tool::new(*name)).collect(),
                calls: Mutex::new(Vec::new()),
                fail_refresh: false,
            }
        }
    }

    #[async_trait]
    impl ToolClient for StaticClient {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> ClientState {
            ClientState::Ready
        }

        async fn initialize(&self, _cancel: &CancellationToken) -> McpResult<()> {
            Ok(())
        }

        fn tools(&self) -> Vec<Tool> {
            self.tools.clone()
        }

        async fn refresh_tools(&self, _cancel: &CancellationToken) -> McpResult<()> {
            if self.fail_refresh {
                return Err(McpError::Transport("refresh failed".to_string()));
            }
            Ok(())
        }

        async fn call_tool(
            &self,
            _cancel: &CancellationToken,
            name: &str,
            _args: Map<String, Value>,
        ) -> McpResult<CallToolResult> {
            self.calls.lock().push(name.to_string());
            Ok(CallToolResult::text(format!("{}:{}", self.name, name)))
        }

        async fn close(&self) {}
    }

    #[test]
    fn name_grammar() {
        assert!(is_valid_name("server-1"));
        assert!(is_valid_name("get_weather"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("dotted.name"));
    }

    #[test]
    fn split_at_first_separator() {
        assert_eq!(split_name("files__read__all"), Some(("files", "read__all")));
        assert_eq!(split_name("nounderscore"), None);
        assert_eq!(split_name("__tool"), None);
    }

    #[tokio::test]
    async fn register_indexes_prefixed_tools() {
        let catalog = ToolCatalog::new();
        catalog
            .register(Arc::new(StaticClient::new("files", &["read", "write"])))
            .unwrap();
        catalog
            .register(Arc::new(StaticClient::new("web", &["search"])))
            .unwrap();

        let names: Vec<String> = catalog.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["files__read", "files__write", "web__search"]);
        assert_eq!(catalog.stats().tool_count, 3);
    }

    #[tokio::test]
    async fn duplicate_server_is_rejected() {
        let catalog = ToolCatalog::new();
        catalog
            .register(Arc::new(StaticClient::new("files", &["read"])))
            .unwrap();
        let result = catalog.register(Arc::new(StaticClient::new("files", &["other"])));
        assert!(matches!(result, Err(McpError::InvalidName(_))));
    }

    #[tokio::test]
    async fn call_routes_to_owner_with_unprefixed_name() {
        let catalog = ToolCatalog::new();
        let files = Arc::new(StaticClient::new("files", &["read"]));
        catalog.register(Arc::clone(&files) as Arc<dyn ToolClient>).unwrap();

        let cancel = CancellationToken::new();
        let result = catalog
            .call_tool(&cancel, "files__read", Map::new())
            .await
            .unwrap();
        assert_eq!(result.joined_text(), "files:read");
        assert_eq!(files.calls.lock().as_slice(), &["read".to_string()]);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let catalog = ToolCatalog::new();
        let cancel = CancellationToken::new();
        let result = catalog.call_tool(&cancel, "nope__missing", Map::new()).await;
        assert!(matches!(result, Err(McpError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn remove_unindexes_tools() {
        let catalog = ToolCatalog::new();
        catalog
            .register(Arc::new(StaticClient::new("files", &["read"])))
            .unwrap();
        assert!(catalog.remove("files").is_some());
        assert!(catalog.remove("files").is_none());
        assert_eq!(catalog.stats().tool_count, 0);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_existing_index() {
        let catalog = ToolCatalog::new();
        let mut client = StaticClient::new("files", &["read"]);
        client.fail_refresh = true;
        catalog.register(Arc::new(client)).unwrap();

        let cancel = CancellationToken::new();
        catalog.refresh_tools(&cancel).await;
        assert_eq!(catalog.stats().tool_count, 1);
    }
}
