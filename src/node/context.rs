use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::channels::error::{ChannelError, ChannelResult};
use crate::index::ack_buffer::Buffered;
use crate::index::dispatcher::{AckTally, NodeDispatcher};
use crate::index::inbox::Inbox;
use crate::index::index_table::{EntryKind, IndexTable};
use crate::link::loopback::LoopbackLink;
use crate::link::profile::{LinkProfile, Specification};
use crate::link::protocol::{LinkContext, LinkServer, NodeAddressId, Protocol};
use crate::link::registry::LinkRegistry;
use crate::link::stream_link::StreamLink;
use crate::link::Link;
use crate::messages::message::{ChannelIndex, Message, MessageBody};
use crate::node::config::NodeConfig;
use crate::node::hierarchy::{HierarchyId, IdKind};
use crate::node::location::{ChannelTarget, NetChannelLocation};
use crate::node::node_id::NodeId;
use crate::node::service::ServiceRegistry;


/// Everything a node's channels share: its identity, the index table, links and services.
///
/// There is no process wide state - each node context is constructed explicitly, and several of
///  them can live in the same process (e.g. in tests).
pub struct NodeContext {
    config: NodeConfig,
    node_id: NodeId,
    hierarchy: Arc<HierarchyId>,
    table: Arc<IndexTable>,
    dispatcher: Arc<NodeDispatcher>,
    links: Arc<LinkRegistry>,
    loopback: Arc<LoopbackLink>,
    protocols: RwLock<FxHashMap<String, Arc<dyn Protocol>>>,
    known_addresses: RwLock<FxHashMap<NodeId, Vec<NodeAddressId>>>,
    services: ServiceRegistry,
}

impl NodeContext {
    /// NB: This spawns the loopback link's tasks, so it must be called inside a Tokio runtime
    pub fn new(config: NodeConfig) -> anyhow::Result<Arc<NodeContext>> {
        config.validate()?;

        let node_id = NodeId::new_random();
        let table = Arc::new(IndexTable::new(config.initial_inbox_capacity));
        let links = Arc::new(LinkRegistry::default());
        let dispatcher = Arc::new(NodeDispatcher::new(table.clone(), Arc::downgrade(&links)));
        let loopback = LoopbackLink::new(node_id, dispatcher.clone());

        info!(name = %config.name, node = %node_id, "starting node");

        Ok(Arc::new(NodeContext {
            hierarchy: HierarchyId::for_node(&config.domain, node_id),
            config,
            node_id,
            table,
            dispatcher,
            links,
            loopback,
            protocols: Default::default(),
            known_addresses: Default::default(),
            services: Default::default(),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn hierarchy(&self) -> &Arc<HierarchyId> {
        &self.hierarchy
    }

    pub fn application_id(&self, name: &str) -> Arc<HierarchyId> {
        self.hierarchy.child(IdKind::Application, name)
    }

    pub fn table(&self) -> &Arc<IndexTable> {
        &self.table
    }

    pub fn links(&self) -> &Arc<LinkRegistry> {
        &self.links
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// the acknowledgements received for `LinkLost` notices so far
    pub fn link_lost_acks(&self) -> &Arc<AckTally> {
        self.dispatcher.link_lost_acks()
    }

    pub fn link_context(&self) -> LinkContext {
        LinkContext {
            self_node: self.node_id,
            dispatcher: self.dispatcher.clone(),
            registry: self.links.clone(),
            max_frame_len: self.config.max_frame_len,
        }
    }

    pub async fn register_protocol(&self, protocol: Arc<dyn Protocol>) {
        debug!("registering protocol {:?}", protocol.id());
        self.protocols.write().await
            .insert(protocol.id().to_string(), protocol);
    }

    pub async fn protocol(&self, id: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.read().await
            .get(id)
            .cloned()
    }

    /// remembers where a node can be reached, for re-establishing lost links
    pub async fn remember_address(&self, node: NodeId, address: NodeAddressId) {
        let mut known = self.known_addresses.write().await;
        let addresses = known.entry(node).or_default();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    pub async fn start_link_server(&self, address: &NodeAddressId) -> anyhow::Result<Box<dyn LinkServer>> {
        let protocol = self.protocol(address.protocol()).await
            .ok_or_else(|| anyhow::anyhow!("no protocol registered for {}", address))?;
        protocol.start_link_server(address, &self.link_context()).await
    }

    /// Establishes and registers a link to whichever node listens at `address`.
    pub async fn connect(&self, address: &NodeAddressId) -> ChannelResult<Arc<dyn Link>> {
        let protocol = self.protocol(address.protocol()).await
            .ok_or_else(|| ChannelError::Link(format!("no protocol registered for {}", address)))?;

        let link = protocol.connect(address, &self.link_context()).await
            .map_err(ChannelError::link)?;

        self.remember_address(link.remote_node(), address.clone()).await;
        self.links.add(link.clone()).await;
        Ok(link)
    }

    /// Turns an already connected byte stream into a registered link. Both ends of the stream
    ///  must do this.
    pub async fn attach_stream<S>(&self, stream: S) -> anyhow::Result<Arc<dyn Link>>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let link: Arc<dyn Link> = StreamLink::establish(stream, &self.link_context(), Specification::stream("stream")).await?;
        self.links.add(link.clone()).await;
        Ok(link)
    }

    /// A link to `node` satisfying `profile`: the loopback link for this node itself, else a
    ///  registered link, else a new link through one of the node's known addresses.
    pub async fn link_to(&self, node: NodeId, profile: Option<&LinkProfile>) -> ChannelResult<Arc<dyn Link>> {
        if node == self.node_id {
            let loopback: Arc<dyn Link> = self.loopback.clone();
            return Ok(loopback);
        }

        if let Some(link) = self.links.get(node, profile).await {
            return Ok(link);
        }

        let addresses = self.known_addresses.read().await
            .get(&node)
            .cloned()
            .unwrap_or_default();

        for address in addresses {
            match self.connect(&address).await {
                Ok(link) if link.remote_node() != node => {
                    // a different node (e.g. restarted) listens there now
                    warn!("{} is now {:?} instead of {:?}", address, link.remote_node(), node);
                }
                Ok(link) => {
                    if profile.map(|p| p.matches(&link.specification())).unwrap_or(true) {
                        return Ok(link);
                    }
                }
                Err(e) => debug!("could not connect to {:?} at {}: {}", node, address, e),
            }
        }

        Err(ChannelError::NoRoute(node))
    }

    /// The index a location refers to, looking up labels on the owning node if necessary.
    pub async fn resolve(&self, location: &NetChannelLocation) -> ChannelResult<ChannelIndex> {
        let label = match &location.target {
            ChannelTarget::Index(index) => return Ok(*index),
            ChannelTarget::Label(label) => label,
        };

        if location.node == self.node_id {
            return self.table.lookup_label(label).await
                .map(|(index, _)| index)
                .ok_or_else(|| ChannelError::UnknownLabel(label.clone()));
        }

        let link = self.link_to(location.node, None).await?;
        let (reply_index, inbox) = self.table.allocate(None, EntryKind::Reply { link: Some(link.id()) }).await?;
        let result = lookup_label_over_link(link.as_ref(), reply_index, &inbox, label).await;
        self.table.remove(reply_index, &inbox).await;
        result
    }

    /// stops all services and closes all links
    pub async fn shutdown(&self) {
        info!(node = %self.node_id, "shutting down node");
        self.services.stop_all().await;
        self.links.close_all().await;
        self.loopback.close().await;
    }
}

async fn lookup_label_over_link(link: &dyn Link, reply_index: ChannelIndex, inbox: &Inbox, label: &str) -> ChannelResult<ChannelIndex> {
    let request = Message::new(ChannelIndex::INVALID, reply_index, MessageBody::LabelLookup { label: label.to_string() });
    link.transmit(request).await
        .map_err(ChannelError::link)?;

    loop {
        match inbox.get().await? {
            Buffered::Message(Message { body: MessageBody::LabelLookupReply { index }, .. }) => {
                return if index.is_valid() {
                    Ok(index)
                }
                else {
                    Err(ChannelError::UnknownLabel(label.to_string()))
                };
            }
            other => debug!("unexpected reply to label lookup: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::node_id::DomainId;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = NodeConfig {
            initial_inbox_capacity: 0,
            ..NodeConfig::new("a")
        };
        assert!(NodeContext::new(config).is_err());
    }

    #[tokio::test]
    async fn test_hierarchy() {
        let config = NodeConfig {
            domain: DomainId::new("physics").unwrap(),
            ..NodeConfig::new("a")
        };
        let ctx = NodeContext::new(config).unwrap();
        let other = NodeContext::new(NodeConfig::new("b")).unwrap();

        let app = ctx.application_id("solver");
        assert!(app.is_on_same_branch(ctx.hierarchy()));
        assert!(!app.is_on_same_branch(other.hierarchy()));
        assert_eq!(app.ancestor_of_kind(IdKind::Node).unwrap().name(), ctx.node_id().to_string());
        assert_eq!(app.ancestor_of_kind(IdKind::Domain).unwrap().name(), "Domain :physics");
    }

    #[tokio::test]
    async fn test_link_to_self_is_loopback() {
        let ctx = NodeContext::new(NodeConfig::new("a")).unwrap();
        let link = ctx.link_to(ctx.node_id(), None).await.unwrap();
        assert_eq!(link.remote_node(), ctx.node_id());
        assert_eq!(link.specification(), Specification::loopback());
    }

    #[tokio::test]
    async fn test_no_route() {
        let ctx = NodeContext::new(NodeConfig::new("a")).unwrap();
        let unknown = NodeId { unique: ctx.node_id().unique.wrapping_add(1) };
        assert_eq!(ctx.link_to(unknown, None).await.err().unwrap(), ChannelError::NoRoute(unknown));
    }

    #[tokio::test]
    async fn test_resolve_local() {
        let ctx = NodeContext::new(NodeConfig::new("a")).unwrap();
        let (index, _) = ctx.table().allocate(Some("echo"), EntryKind::Input).await.unwrap();

        assert_eq!(ctx.resolve(&NetChannelLocation::labelled(ctx.node_id(), "echo")).await.unwrap(), index);
        assert_eq!(ctx.resolve(&NetChannelLocation::new(ctx.node_id(), ChannelIndex(99))).await.unwrap(), ChannelIndex(99));
        assert_eq!(ctx.resolve(&NetChannelLocation::labelled(ctx.node_id(), "nope")).await.unwrap_err(), ChannelError::UnknownLabel("nope".to_string()));
    }
}
