pub mod loopback;
pub mod message_dispatcher;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod stream_link;
pub mod tcp;

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Buf, BufMut};
#[cfg(test)] use mockall::automock;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::link::message_dispatcher::MessageDispatcher;
use crate::link::profile::Specification;
use crate::messages::message::{Message, ReplySink};
use crate::node::node_id::NodeId;


/// Identifies a single link session. A reconnect to the same node is a different link.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct LinkId(pub Uuid);

impl LinkId {
    pub fn new_random() -> LinkId {
        LinkId(Uuid::new_v4())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.0.as_u128());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<LinkId> {
        Ok(LinkId(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Link[{}]", self.0)
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// An active bidirectional transport session between this node and one remote node. Messages
///  are delivered in the order they were transmitted; received messages go to the node's
///  `MessageDispatcher`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Link: Send + Sync + 'static {
    fn id(&self) -> LinkId;

    fn remote_node(&self) -> NodeId;

    fn specification(&self) -> Specification;

    /// Hands a message to the link's transmit queue. This does not wait for the message to be
    ///  written to the wire.
    async fn transmit(&self, msg: Message) -> anyhow::Result<()>;

    fn is_connected(&self) -> bool;

    /// Terminates the link. The node is notified of the link's loss exactly once, regardless of
    ///  whether the link was closed explicitly or failed.
    async fn close(&self);

    /// resolves once the link is terminated
    async fn closed(&self);
}


/// The reply path for messages received over a link: replies are queued for transmission on the
///  same link they arrived on.
pub struct LinkSender {
    link_id: LinkId,
    outbound: mpsc::UnboundedSender<Message>,
}

impl LinkSender {
    pub fn new(link_id: LinkId, outbound: mpsc::UnboundedSender<Message>) -> LinkSender {
        LinkSender {
            link_id,
            outbound,
        }
    }

    pub fn send(&self, msg: Message) -> anyhow::Result<()> {
        self.outbound.send(msg)
            .map_err(|_| anyhow!("link {} is closed", self.link_id))
    }
}

#[async_trait]
impl ReplySink for LinkSender {
    async fn reply(&self, msg: Message) -> anyhow::Result<()> {
        self.send(msg)
    }
}


/// Connection state shared between a link and its transmit / receive tasks. Whoever terminates
///  the link first stops the tasks and reports the loss, later calls do nothing.
pub(crate) struct LinkLiveness {
    link_id: LinkId,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
    dispatcher: Arc<dyn MessageDispatcher>,
}

impl LinkLiveness {
    pub(crate) fn new(link_id: LinkId, dispatcher: Arc<dyn MessageDispatcher>) -> LinkLiveness {
        LinkLiveness {
            link_id,
            connected: AtomicBool::new(true),
            shutdown: watch::Sender::new(false),
            dispatcher,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) async fn closed(&self) {
        wait_for_shutdown(&mut self.shutdown_signal()).await
    }

    pub(crate) async fn terminate(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(link = %self.link_id, "link terminated");
            self.shutdown.send_replace(true);
            self.dispatcher.on_link_lost(self.link_id).await;
        }
    }
}

/// resolves when the link was terminated
pub(crate) async fn wait_for_shutdown(signal: &mut watch::Receiver<bool>) {
    loop {
        let terminated = *signal.borrow_and_update();
        if terminated {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}
