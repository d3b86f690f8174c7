use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::channels::error::{ChannelError, ChannelResult};
use crate::index::ack_buffer::Buffered;
use crate::index::inbox::Inbox;
use crate::index::index_table::EntryKind;
use crate::link::profile::LinkProfile;
use crate::link::Link;
use crate::messages::message::{ChannelIndex, Message, MessageBody};
use crate::messages::serialized::{NetSerializable, SerializedObject};
use crate::node::context::NodeContext;
use crate::node::location::NetChannelLocation;


/// the link-facing resources of an output end
struct Binding {
    link: Arc<dyn Link>,
    dest_index: ChannelIndex,
    reply_index: ChannelIndex,
    reply_inbox: Arc<Inbox>,
    /// set while an acknowledged write waits for its outcome. If it is still set when the next
    ///  write starts, that wait was abandoned and its reply may still arrive.
    awaiting_reply: bool,
}

/// The output end of a network channel, writing to a `Net2One` / `Net2Any` on some node.
///
/// An acknowledged `write` returns once the destination's reader took the value (or rejected
///  it). Unacknowledged writes return as soon as the message is handed to the link: they have
///  no delivery confirmation and no backpressure.
///
/// After `LinkLost`, every write fails until the end is rebound with `recreate`.
pub struct One2Net<T> {
    ctx: Arc<NodeContext>,
    target: NetChannelLocation,
    profile: Option<LinkProfile>,
    acknowledged: bool,
    binding: Option<Binding>,
    destroyed: bool,
    _payload: PhantomData<fn(&T)>,
}

impl<T: NetSerializable> One2Net<T> {
    /// acknowledged unless the node is configured otherwise
    pub async fn new(ctx: &Arc<NodeContext>, target: NetChannelLocation) -> ChannelResult<One2Net<T>> {
        Self::create(ctx, target, None, ctx.config().default_acknowledged).await
    }

    pub async fn unacknowledged(ctx: &Arc<NodeContext>, target: NetChannelLocation) -> ChannelResult<One2Net<T>> {
        Self::create(ctx, target, None, false).await
    }

    /// an output end that only uses links satisfying `profile`
    pub async fn with_profile(ctx: &Arc<NodeContext>, target: NetChannelLocation, profile: LinkProfile) -> ChannelResult<One2Net<T>> {
        Self::create(ctx, target, Some(profile), ctx.config().default_acknowledged).await
    }

    async fn create(ctx: &Arc<NodeContext>, target: NetChannelLocation, profile: Option<LinkProfile>, acknowledged: bool) -> ChannelResult<One2Net<T>> {
        let mut result = One2Net {
            ctx: ctx.clone(),
            target,
            profile,
            acknowledged,
            binding: None,
            destroyed: false,
            _payload: PhantomData,
        };
        result.bind().await?;
        Ok(result)
    }

    async fn bind(&mut self) -> ChannelResult<()> {
        let link = self.ctx.link_to(self.target.node, self.profile.as_ref()).await?;
        let dest_index = self.ctx.resolve(&self.target).await?;
        let (reply_index, reply_inbox) = self.ctx.table()
            .allocate(None, EntryKind::Reply { link: Some(link.id()) }).await?;

        debug!(target = %self.target, link = %link.id(), ?reply_index, "bound network output");
        self.binding = Some(Binding { link, dest_index, reply_index, reply_inbox, awaiting_reply: false });
        Ok(())
    }

    /// Replaces the reply channel with a fresh one. Replies to abandoned writes then go to an index
    ///  that no longer exists, and the dispatcher drops them.
    async fn renew_reply_channel(&mut self) -> ChannelResult<()> {
        let Some(binding) = self.binding.as_mut() else {
            return Err(ChannelError::Destroyed);
        };
        let table = self.ctx.table();
        table.remove(binding.reply_index, &binding.reply_inbox).await;
        let (reply_index, reply_inbox) = match table.allocate(None, EntryKind::Reply { link: Some(binding.link.id()) }).await {
            Ok(allocated) => allocated,
            Err(e) => {
                self.binding = None;
                return Err(e);
            }
        };

        debug!(old = ?binding.reply_index, new = ?reply_index, "previous write was abandoned - renewed reply channel");
        binding.reply_index = reply_index;
        binding.reply_inbox = reply_inbox;
        binding.awaiting_reply = false;
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(binding) = self.binding.take() {
            self.ctx.table().remove(binding.reply_index, &binding.reply_inbox).await;
        }
    }

    /// the location this end writes to, as it was given (i.e. possibly by label)
    pub fn location(&self) -> &NetChannelLocation {
        &self.target
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Resolves once the link this end is bound to is lost, with the error writes would then
    ///  report. An unbound end resolves with `Destroyed` right away.
    pub async fn link_lost(&self) -> ChannelError {
        match &self.binding {
            Some(binding) => {
                binding.link.closed().await;
                ChannelError::LinkLost(binding.link.id())
            }
            None => ChannelError::Destroyed,
        }
    }

    pub async fn write(&mut self, value: &T) -> ChannelResult<()> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }
        if self.binding.as_ref().is_some_and(|b| b.awaiting_reply) {
            self.renew_reply_channel().await?;
        }
        let binding = match self.binding.as_mut() {
            Some(b) => b,
            None => return Err(ChannelError::Destroyed),
        };

        let msg = Message::data(binding.dest_index, binding.reply_index, SerializedObject::new(value), self.acknowledged);
        trace!("writing {:?}", msg);
        if let Err(e) = binding.link.transmit(msg).await {
            if !binding.link.is_connected() {
                return Err(ChannelError::LinkLost(binding.link.id()));
            }
            return Err(ChannelError::link(e));
        }

        if !self.acknowledged {
            return Ok(());
        }

        binding.awaiting_reply = true;
        let result = Self::await_reply(&binding.reply_inbox).await;
        binding.awaiting_reply = false;
        result
    }

    async fn await_reply(reply_inbox: &Inbox) -> ChannelResult<()> {
        loop {
            match reply_inbox.get().await? {
                Buffered::Acks(acks) => {
                    if acks.count > 1 {
                        warn!("received {} acknowledgements for a single write", acks.count);
                    }
                    return Ok(());
                }
                Buffered::Message(Message { body: MessageBody::Ack, .. }) => return Ok(()),
                Buffered::Message(Message { body: MessageBody::WriteRejected, .. }) => return Err(ChannelError::WriteRejected),
                Buffered::Message(other) => warn!("unexpected reply to a write: {:?}", other),
            }
        }
    }

    /// Rebinds to the same location, e.g. after `LinkLost`: reacquires a link (reconnecting if
    ///  the node has a known address) and a fresh reply channel.
    pub async fn recreate(&mut self) -> ChannelResult<()> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }
        self.release().await;
        self.bind().await
    }

    /// rebinds to a different location
    pub async fn recreate_to(&mut self, target: NetChannelLocation) -> ChannelResult<()> {
        self.target = target;
        self.recreate().await
    }

    /// Releases the end's resources. Any further write fails with `Destroyed`.
    pub async fn destroy_writer(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.release().await;
    }
}

impl<T> Drop for One2Net<T> {
    fn drop(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        let table = self.ctx.table().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    table.remove(binding.reply_index, &binding.reply_inbox).await;
                });
            }
            Err(_) => warn!(index = ?binding.reply_index, "network output dropped outside a runtime - its reply channel is not released"),
        }
    }
}


/// An output end shared by any number of local writers. Operations are serialized, so there is
///  at most one write in flight.
pub struct Any2Net<T> {
    inner: Arc<Mutex<One2Net<T>>>,
}

impl<T> Clone for Any2Net<T> {
    fn clone(&self) -> Self {
        Any2Net { inner: self.inner.clone() }
    }
}

impl<T: NetSerializable> Any2Net<T> {
    pub async fn new(ctx: &Arc<NodeContext>, target: NetChannelLocation) -> ChannelResult<Any2Net<T>> {
        Ok(One2Net::<T>::new(ctx, target).await?.into())
    }

    pub async fn unacknowledged(ctx: &Arc<NodeContext>, target: NetChannelLocation) -> ChannelResult<Any2Net<T>> {
        Ok(One2Net::<T>::unacknowledged(ctx, target).await?.into())
    }

    pub async fn with_profile(ctx: &Arc<NodeContext>, target: NetChannelLocation, profile: LinkProfile) -> ChannelResult<Any2Net<T>> {
        Ok(One2Net::<T>::with_profile(ctx, target, profile).await?.into())
    }

    pub async fn write(&self, value: &T) -> ChannelResult<()> {
        self.inner.lock().await
            .write(value).await
    }

    pub async fn recreate(&self) -> ChannelResult<()> {
        self.inner.lock().await
            .recreate().await
    }

    pub async fn recreate_to(&self, target: NetChannelLocation) -> ChannelResult<()> {
        self.inner.lock().await
            .recreate_to(target).await
    }

    pub async fn destroy_writer(&self) {
        self.inner.lock().await
            .destroy_writer().await
    }

    pub async fn location(&self) -> NetChannelLocation {
        self.inner.lock().await
            .location().clone()
    }
}

impl<T> From<One2Net<T>> for Any2Net<T> {
    fn from(value: One2Net<T>) -> Self {
        Any2Net { inner: Arc::new(Mutex::new(value)) }
    }
}
