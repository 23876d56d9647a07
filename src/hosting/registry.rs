// Seam to the host's live server registry, plus an in-process implementation.
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub address: SocketAddr,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Live backend servers known to the host, keyed by unique name.
pub trait ServerRegistry: Send + Sync {
    /// Fails with `AlreadyExists` when the name is taken.
    fn register(&self, server: ServerInfo) -> Result<(), Error>;

    /// Returns whether a server was removed.
    fn unregister(&self, name: &str) -> bool;

    fn server(&self, name: &str) -> Option<ServerInfo>;

    fn servers(&self) -> Vec<ServerInfo>;
}

#[derive(Clone, Default)]
pub struct MemoryServerRegistry {
    servers: Arc<RwLock<BTreeMap<String, ServerInfo>>>,
}

impl MemoryServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerRegistry for MemoryServerRegistry {
    fn register(&self, server: ServerInfo) -> Result<(), Error> {
        let mut servers = self
            .servers
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        if servers.contains_key(&server.name) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("server already registered")
                .with_key(&server.name));
        }
        servers.insert(server.name.clone(), server);
        Ok(())
    }

    fn unregister(&self, name: &str) -> bool {
        self.servers
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(name)
            .is_some()
    }

    fn server(&self, name: &str) -> Option<ServerInfo> {
        self.servers
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(name)
            .cloned()
    }

    fn servers(&self) -> Vec<ServerInfo> {
        self.servers
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Resolves a transfer destination: the exact server name, else the first `<destination>-*` server.
pub fn find_server(registry: &dyn ServerRegistry, destination: &str) -> Option<ServerInfo> {
    if let Some(server) = registry.server(destination) {
        return Some(server);
    }
    let prefix = format!("{destination}-");
    let mut candidates: Vec<ServerInfo> = registry
        .servers()
        .into_iter()
        .filter(|server| server.name.starts_with(&prefix))
        .collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    candidates.into_iter().next()
}
