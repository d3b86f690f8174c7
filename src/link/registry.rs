use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::link::profile::LinkProfile;
use crate::link::{Link, LinkId};
use crate::node::node_id::NodeId;


/// The live links of a node, grouped by remote node
#[derive(Default)]
pub struct LinkRegistry {
    links: RwLock<FxHashMap<NodeId, Vec<Arc<dyn Link>>>>,
}

impl LinkRegistry {
    pub async fn add(&self, link: Arc<dyn Link>) {
        debug!(link = %link.id(), remote = ?link.remote_node(), "registering link");
        self.links.write().await
            .entry(link.remote_node())
            .or_default()
            .push(link);
    }

    pub async fn remove(&self, link_id: LinkId) -> Option<Arc<dyn Link>> {
        let mut links = self.links.write().await;

        let mut result = None;
        for node_links in links.values_mut() {
            if let Some(pos) = node_links.iter().position(|l| l.id() == link_id) {
                result = Some(node_links.remove(pos));
                break;
            }
        }
        links.retain(|_, node_links| !node_links.is_empty());

        if result.is_some() {
            debug!(link = %link_id, "deregistered link");
        }
        result
    }

    /// The first connected link to `node` that satisfies `profile`, or the first connected link
    ///  if there is no profile.
    pub async fn get(&self, node: NodeId, profile: Option<&LinkProfile>) -> Option<Arc<dyn Link>> {
        self.links.read().await
            .get(&node)?
            .iter()
            .filter(|l| l.is_connected())
            .find(|l| profile.map(|p| p.matches(&l.specification())).unwrap_or(true))
            .cloned()
    }

    pub async fn links_to(&self, node: NodeId) -> Vec<Arc<dyn Link>> {
        self.links.read().await
            .get(&node)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.links.read().await
            .values()
            .map(|l| l.len())
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// closes all links. Closing a link removes it through the link lost callback.
    pub async fn close_all(&self) {
        let all: Vec<Arc<dyn Link>> = self.links.read().await
            .values()
            .flatten()
            .cloned()
            .collect();

        for link in all {
            link.close().await;
        }
    }
}
