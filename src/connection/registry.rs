use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};

use super::interface::Connection;

/// Connections by the name they were registered under
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<dyn Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its own name, replacing any previous one
    pub fn register(&self, connection: Arc<dyn Connection>) {
        self.connections
            .insert(connection.name().to_string(), connection);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Connection>> {
        self.connections
            .get(name)
            .map(|connection| connection.value().clone())
            .ok_or_else(|| Error::UnknownConnection {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }
}
