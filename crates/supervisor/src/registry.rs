//! Tool name → owning peer.

use std::collections::BTreeMap;
use std::sync::Arc;
use toolmux_core::provider::ToolDefinition;
use toolmux_core::tool::ToolSchema;

use crate::handle::PeerHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate tool '{tool}': advertised by both '{existing}' and '{peer}'")]
    DuplicateTool {
        tool: String,
        existing: String,
        peer: String,
    },
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub schema: ToolSchema,
    pub peer: Arc<PeerHandle>,
}

/// Aggregated view of every tool advertised by a peer set.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
    peers: Vec<Arc<PeerHandle>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every tool `peer` advertised. Either all of them are added or,
    /// on a name collision, none are.
    pub fn register_peer(&mut self, peer: Arc<PeerHandle>, schemas: Vec<ToolSchema>) -> Result<(), RegistryError> {
        let mut incoming: BTreeMap<String, ToolSchema> = BTreeMap::new();
        for mut schema in schemas {
            if let Some(existing) = self.tools.get(&schema.name) {
                return Err(RegistryError::DuplicateTool {
                    tool: schema.name,
                    existing: existing.peer.name().to_string(),
                    peer: peer.name().to_string(),
                });
            }
            if incoming.contains_key(&schema.name) {
                return Err(RegistryError::DuplicateTool {
                    tool: schema.name,
                    existing: peer.name().to_string(),
                    peer: peer.name().to_string(),
                });
            }
            schema.peer = peer.name().to_string();
            incoming.insert(schema.name.clone(), schema);
        }

        for (name, schema) in incoming {
            self.tools.insert(name, RegisteredTool { schema, peer: Arc::clone(&peer) });
        }
        self.peers.push(peer);
        Ok(())
    }

    pub fn resolve(&self, tool: &str) -> Option<&RegisteredTool> {
        self.tools.get(tool)
    }

    /// Schemas with the owning peer filled in, sorted by tool name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema.clone()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.schema.to_definition()).collect()
    }

    pub fn peers(&self) -> &[Arc<PeerHandle>] {
        &self.peers
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
