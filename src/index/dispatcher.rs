use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::index::index_table::IndexTable;
use crate::link::message_dispatcher::MessageDispatcher;
use crate::link::registry::LinkRegistry;
use crate::link::LinkId;
use crate::messages::message::{ChannelIndex, Message, MessageBody, ReplySink};


/// Counts the acknowledgements of broadcast `LinkLost` notices
#[derive(Default)]
pub struct AckTally {
    acks: AtomicUsize,
}

impl AckTally {
    pub fn count(&self) -> usize {
        self.acks.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ReplySink for AckTally {
    async fn reply(&self, msg: Message) -> anyhow::Result<()> {
        match msg.body {
            MessageBody::Ack => {
                self.acks.fetch_add(1, Ordering::AcqRel);
            }
            _ => debug!("ignoring reply to a link lost notice: {:?}", msg),
        }
        Ok(())
    }
}


/// Routes everything the node's links receive into the index table.
pub struct NodeDispatcher {
    table: Arc<IndexTable>,
    links: Weak<LinkRegistry>,
    link_lost_acks: Arc<AckTally>,
}

impl NodeDispatcher {
    pub fn new(table: Arc<IndexTable>, links: Weak<LinkRegistry>) -> NodeDispatcher {
        NodeDispatcher {
            table,
            links,
            link_lost_acks: Default::default(),
        }
    }

    pub fn link_lost_acks(&self) -> &Arc<AckTally> {
        &self.link_lost_acks
    }

    async fn reject(msg: Message) {
        if msg.wants_ack() {
            trace!("rejecting {:?}", msg);
            msg.send_reply(MessageBody::WriteRejected).await;
        }
        else {
            debug!("no live channel for {:?} - dropping", msg);
        }
    }
}

#[async_trait]
impl MessageDispatcher for NodeDispatcher {
    async fn on_message(&self, msg: Message) {
        trace!("dispatching {:?}", msg);

        if let MessageBody::LabelLookup { label } = &msg.body {
            let index = self.table.lookup_label(label).await
                .map(|(index, _)| index)
                .unwrap_or(ChannelIndex::INVALID);
            msg.send_reply(MessageBody::LabelLookupReply { index }).await;
            return;
        }

        match self.table.lookup(msg.dest_index).await {
            Some(inbox) => {
                if let Err(msg) = inbox.put(msg).await {
                    Self::reject(msg).await;
                }
            }
            None => Self::reject(msg).await,
        }
    }

    async fn on_link_lost(&self, link: LinkId) {
        if let Some(links) = self.links.upgrade() {
            links.remove(link).await;
        }
        self.table.broadcast_link_lost(link, self.link_lost_acks.clone()).await;
    }
}
