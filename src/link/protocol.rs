use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;

use crate::link::message_dispatcher::MessageDispatcher;
use crate::link::profile::Specification;
use crate::link::registry::LinkRegistry;
use crate::link::Link;
use crate::node::node_id::NodeId;


/// A transport specific address a node can be reached at
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeAddressId {
    protocol: String,
    address: String,
    globally_unique: bool,
}

impl NodeAddressId {
    pub fn new(protocol: &str, address: &str, globally_unique: bool) -> NodeAddressId {
        NodeAddressId {
            protocol: protocol.to_string(),
            address: address.to_string(),
            globally_unique,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// false for addresses that only make sense locally, e.g. a wildcard bind address
    pub fn is_globally_unique(&self) -> bool {
        self.globally_unique
    }
}

impl Display for NodeAddressId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}


/// What a link needs from the node that owns it
#[derive(Clone)]
pub struct LinkContext {
    pub self_node: NodeId,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub registry: Arc<LinkRegistry>,
    pub max_frame_len: usize,
}


/// A concrete transport
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn specification(&self) -> Specification;

    fn create_address_id(&self, address: &str, globally_unique: bool) -> anyhow::Result<NodeAddressId>;

    /// Establishes a client mode link to the node at `address`. The caller registers the link.
    async fn connect(&self, address: &NodeAddressId, ctx: &LinkContext) -> anyhow::Result<Arc<dyn Link>>;

    /// Starts accepting incoming links at `address`. Accepted links are registered with
    ///  `ctx.registry`.
    async fn start_link_server(&self, address: &NodeAddressId, ctx: &LinkContext) -> anyhow::Result<Box<dyn LinkServer>>;
}

/// A passive listener that spawns a server mode link per accepted connection
#[async_trait]
pub trait LinkServer: Send + Sync + 'static {
    /// the address the server is actually bound to
    fn address(&self) -> &NodeAddressId;

    /// stops accepting. Links that were already established are not affected.
    async fn stop(&self);
}
