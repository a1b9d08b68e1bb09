//! Build-node backend: where the Scheduler learns which nodes exist and
//! what architectures they serve.
//!
//! The upstream loads a backend plugin by name at runtime (Docker, LXC, a
//! cloud fleet) via a dynamic import. Rust has no equivalent of importing a
//! module by string at runtime without real plugin infrastructure (`libloading`
//! dynamic objects), which is out of scope here; a trait object chosen once
//! at startup from a configured name expresses the same "pick one
//! implementation" shape without inventing a plugin ABI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A build node as the Scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub architectures: Vec<String>,
}

/// The subset of a build-node fleet the Scheduler needs: "what nodes exist
/// and what can they build". Dispatch to a node and its result reporting
/// are out of scope for this core.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn get_nodes_info(&self) -> Vec<NodeInfo>;
}

/// A fixed, statically configured node set. Stands in for a real backend
/// (Docker/LXC/cloud) whose node discovery is an external collaborator.
#[derive(Debug, Default)]
pub struct StaticBackend {
    nodes: Vec<NodeInfo>,
}

impl StaticBackend {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl BuildBackend for StaticBackend {
    async fn get_nodes_info(&self) -> Vec<NodeInfo> {
        self.nodes.clone()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn single_node(arches: &[&str]) -> StaticBackend {
        StaticBackend::new(vec![NodeInfo {
            id: "node-1".to_string(),
            name: "node-1".to_string(),
            architectures: arches.iter().map(|s| s.to_string()).collect(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_backend_returns_configured_nodes() {
        let backend = test_support::single_node(&["amd64", "arm64"]);
        let nodes = backend.get_nodes_info().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].architectures, vec!["amd64", "arm64"]);
    }
}
