use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::link::LinkId;
use crate::messages::message::Message;


/// Receives everything a link's receive loop decodes. This is the seam between transport and
///  channel handling: links know nothing about the index table.
///
/// Links fill in `source_node` and `reply_to` before handing a message on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, msg: Message);

    /// called exactly once per link, when it terminates for whatever reason
    async fn on_link_lost(&self, link: LinkId);
}
