use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::select;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::channels::error::{ChannelError, ChannelResult};
use crate::channels::local_channel::{local_channel, LocalReader, LocalWriter, PoisonHandle};
use crate::index::ack_buffer::Buffered;
use crate::index::inbox::Inbox;
use crate::index::index_table::{EntryKind, IndexTable};
use crate::messages::message::{ChannelIndex, Message, MessageBody};
use crate::messages::serialized::NetSerializable;


/// Controls the delivery process of a network input: the task that takes messages from the
///  input's inbox, hands their payloads to the local reader and replies to the senders.
pub(crate) struct DeliveryHandle {
    table: Arc<IndexTable>,
    index: ChannelIndex,
    inbox: Arc<Inbox>,
    poison: PoisonHandle,
    broken: AtomicBool,
    running: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl DeliveryHandle {
    /// Registers a new input in the index table (at `index` if given, else at the next free
    ///  index) and spawns its delivery process.
    pub async fn start<T: NetSerializable>(table: &Arc<IndexTable>, label: Option<&str>, index: Option<ChannelIndex>) -> ChannelResult<(Arc<DeliveryHandle>, LocalReader<T>)> {
        let (index, inbox) = match index {
            Some(index) => (index, table.reserve(index, EntryKind::Input).await?),
            None => table.allocate(label, EntryKind::Input).await?,
        };

        let (writer, reader) = local_channel::<T>();
        let (stop_send, stop_recv) = oneshot::channel();

        let join = tokio::spawn(
            deliver(inbox.clone(), writer, stop_recv)
                .instrument(info_span!("delivery", ?index))
        );

        let handle = Arc::new(DeliveryHandle {
            table: table.clone(),
            index,
            inbox,
            poison: reader.poison_handle(),
            broken: AtomicBool::new(false),
            running: Mutex::new(Some((stop_send, join))),
        });
        Ok((handle, reader))
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Tears the input down: no new messages are routed to it, the local reader is poisoned, and
    ///  everything that was still queued is answered before the delivery process terminates.
    ///
    /// Calling this more than once has no further effect.
    pub async fn break_channel(&self) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(index = ?self.index, "breaking network input");

        // deregistering poisons the inbox, so a concurrent dispatch is rejected by the dispatcher
        self.table.remove(self.index, &self.inbox).await;
        self.poison.poison();

        if let Some((stop, join)) = self.running.lock().await.take() {
            stop.send(()).ok();
            if let Err(e) = join.await {
                warn!(index = ?self.index, "delivery process terminated abnormally: {}", e);
            }
        }
    }

    /// `break_channel` for `Drop` impls, which can not await
    pub fn break_on_drop(self: &Arc<Self>) {
        if self.is_broken() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let handle = self.clone();
                rt.spawn(async move { handle.break_channel().await });
            }
            Err(_) => warn!(index = ?self.index, "network input dropped outside a runtime - it can not be torn down"),
        }
    }
}

async fn deliver<T: NetSerializable>(inbox: Arc<Inbox>, writer: LocalWriter<T>, mut stop: oneshot::Receiver<()>) {
    loop {
        let entry = select! {
            biased;
            _ = &mut stop => break,
            entry = inbox.get() => entry,
        };

        match entry {
            Ok(Buffered::Message(msg)) => on_message(msg, &writer).await,
            Ok(Buffered::Acks(acks)) => warn!("unexpected acknowledgements on a network input: {:?}", acks),
            Err(ChannelError::Poisoned) => break,
            Err(e) => {
                warn!("network input failed: {}", e);
                break;
            }
        }
    }

    drain(&inbox).await;
    trace!("delivery process terminated");
}

async fn on_message<T: NetSerializable>(msg: Message, writer: &LocalWriter<T>) {
    match &msg.body {
        MessageBody::Data { payload, acknowledged } => {
            let result = match payload.get::<T>() {
                Ok(value) => writer.write(value).await,
                Err(e) => {
                    warn!("could not deserialize payload {:?}: {}", payload, e);
                    Err(ChannelError::serialization(e))
                }
            };

            if *acknowledged {
                let reply = match result {
                    Ok(()) => MessageBody::Ack,
                    Err(_) => MessageBody::WriteRejected,
                };
                msg.send_reply(reply).await;
            }
        }
        MessageBody::LinkLost { link } => {
            debug!(%link, "link lost notice");
            msg.send_reply(MessageBody::Ack).await;
        }
        _ => warn!("unexpected message on a network input: {:?}", msg),
    }
}

/// Answers everything still queued after the input was torn down, so no sender waits forever.
async fn drain(inbox: &Inbox) {
    while let Some(entry) = inbox.try_get().await {
        match entry {
            Buffered::Message(msg) => match &msg.body {
                MessageBody::Data { acknowledged: true, .. } => msg.send_reply(MessageBody::WriteRejected).await,
                MessageBody::Data { .. } => trace!("dropping unacknowledged {:?}", msg),
                MessageBody::LinkLost { .. } => msg.send_reply(MessageBody::Ack).await,
                _ => warn!("unexpected message on a network input: {:?}", msg),
            },
            Buffered::Acks(acks) => warn!("unexpected acknowledgements on a network input: {:?}", acks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkId;
    use crate::messages::message::ReplySink;
    use crate::messages::serialized::SerializedObject;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// forwards replies to a channel
    struct ReplyChannel(mpsc::UnboundedSender<Message>);
    #[async_trait]
    impl ReplySink for ReplyChannel {
        async fn reply(&self, msg: Message) -> anyhow::Result<()> {
            self.0.send(msg)?;
            Ok(())
        }
    }

    fn data(dest: ChannelIndex, payload: &str, sink: &Arc<ReplyChannel>) -> Message {
        let mut msg = Message::data(dest, ChannelIndex(42), SerializedObject::new(&payload.to_string()), true);
        msg.reply_to = Some(sink.clone());
        msg
    }

    fn sink() -> (Arc<ReplyChannel>, mpsc::UnboundedReceiver<Message>) {
        let (send, recv) = mpsc::unbounded_channel();
        (Arc::new(ReplyChannel(send)), recv)
    }

    async fn next_reply(replies: &mut mpsc::UnboundedReceiver<Message>) -> MessageBody {
        timeout(Duration::from_secs(1), replies.recv()).await.unwrap().unwrap().body
    }

    #[tokio::test]
    async fn test_data_is_delivered_and_acknowledged() {
        let table = Arc::new(IndexTable::new(4));
        let (handle, mut reader) = DeliveryHandle::start::<String>(&table, None, None).await.unwrap();
        let (sink, mut replies) = sink();

        let inbox = table.lookup(handle.index()).await.unwrap();
        inbox.put(data(handle.index(), "ping", &sink)).await.unwrap();

        assert_eq!(reader.read().await.unwrap(), "ping");
        let reply = timeout(Duration::from_secs(1), replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.body, MessageBody::Ack);
        assert_eq!(reply.dest_index, ChannelIndex(42));
        assert_eq!(reply.source_index, handle.index());
    }

    #[tokio::test]
    async fn test_link_lost_is_acknowledged_not_delivered() {
        let table = Arc::new(IndexTable::new(4));
        let (handle, mut reader) = DeliveryHandle::start::<String>(&table, None, None).await.unwrap();
        let (sink, mut replies) = sink();

        let mut notice = Message::new(handle.index(), ChannelIndex::INVALID, MessageBody::LinkLost { link: LinkId::new_random() });
        notice.reply_to = Some(sink.clone());
        table.lookup(handle.index()).await.unwrap().put(notice).await.unwrap();

        assert_eq!(next_reply(&mut replies).await, MessageBody::Ack);
        assert!(timeout(Duration::from_millis(50), reader.read()).await.is_err());
    }

    #[tokio::test]
    async fn test_undeserializable_payload_is_rejected() {
        let table = Arc::new(IndexTable::new(4));
        let (handle, _reader) = DeliveryHandle::start::<u64>(&table, None, None).await.unwrap();
        let (sink, mut replies) = sink();

        table.lookup(handle.index()).await.unwrap()
            .put(data(handle.index(), "not a number", &sink)).await.unwrap();
        assert_eq!(next_reply(&mut replies).await, MessageBody::WriteRejected);
    }

    #[tokio::test]
    async fn test_break_mid_flight_rejects_each_write_once() {
        let table = Arc::new(IndexTable::new(4));
        let (handle, reader) = DeliveryHandle::start::<String>(&table, None, None).await.unwrap();
        let (sink, mut replies) = sink();

        // nobody reads: the first message blocks the delivery process, the others stay queued
        let inbox = table.lookup(handle.index()).await.unwrap();
        for payload in ["a", "b", "c"] {
            inbox.put(data(handle.index(), payload, &sink)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.break_channel().await;
        handle.break_channel().await;

        for _ in 0..3 {
            assert_eq!(next_reply(&mut replies).await, MessageBody::WriteRejected);
        }
        assert!(replies.try_recv().is_err());

        assert!(table.lookup(handle.index()).await.is_none());
        assert!(handle.is_broken());
        drop(reader);
    }

    #[tokio::test]
    async fn test_drop_breaks_channel() {
        let table = Arc::new(IndexTable::new(4));
        let (handle, _reader) = DeliveryHandle::start::<String>(&table, Some("echo"), None).await.unwrap();
        assert!(table.lookup_label("echo").await.is_some());

        handle.break_on_drop();
        timeout(Duration::from_secs(1), async {
            while table.lookup_label("echo").await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_index() {
        let table = Arc::new(IndexTable::new(4));
        let (handle, _reader) = DeliveryHandle::start::<String>(&table, None, Some(ChannelIndex(100))).await.unwrap();
        assert_eq!(handle.index(), ChannelIndex(100));

        let result = DeliveryHandle::start::<String>(&table, None, Some(ChannelIndex(100))).await;
        assert_eq!(result.err().unwrap(), ChannelError::IndexInUse(ChannelIndex(100)));
    }
}
