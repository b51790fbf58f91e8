use serenity::model::id::UserId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audio::manager::PlayerRegistry;
use crate::error::{Error, Result};
use crate::node::{Node, NodeConfig, NodeLink};

/// Registro de nodos de audio, construido una vez al arranque.
///
/// El despliegue de un solo nodo es el caso degenerado de la selección por
/// carga; no hay camino especial para él.
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    shutdown: CancellationToken,
}

impl NodePool {
    pub fn new(
        configs: Vec<NodeConfig>,
        user_id: UserId,
        registry: Arc<PlayerRegistry>,
        request_timeout: Duration,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Config("se necesita al menos un nodo de audio".into()));
        }

        let shutdown = CancellationToken::new();
        let nodes = configs
            .into_iter()
            .map(|config| {
                Node::new(
                    config,
                    user_id,
                    Arc::clone(&registry),
                    request_timeout,
                    shutdown.child_token(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { nodes, shutdown })
    }

    /// Conecta todos los nodos en segundo plano.
    pub fn start(&self) {
        info!("🎼 Conectando {} nodo(s) de audio", self.nodes.len());
        for node in &self.nodes {
            node.start();
        }
    }

    /// Detiene los receive loops y marca todo como no disponible.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// El nodo disponible con menor carga.
    pub fn best_node(&self) -> Result<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| n.is_available())
            .min_by(|a, b| {
                a.penalty()
                    .partial_cmp(&b.penalty())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .ok_or(Error::NodeUnavailable)
    }

    pub fn node(&self, identifier: &str) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|n| n.identifier() == identifier)
            .cloned()
    }

    pub fn any_available(&self) -> bool {
        self.nodes.iter().any(|n| n.is_available())
    }
}
