use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info_span, trace, warn, Instrument};

use crate::link::message_dispatcher::MessageDispatcher;
use crate::link::profile::Specification;
use crate::link::{wait_for_shutdown, Link, LinkId, LinkLiveness, LinkSender};
use crate::messages::message::Message;
use crate::node::node_id::NodeId;


/// The link a node uses to talk to itself.
///
/// Messages take the same path as over a real link: they are serialized by a transmit task and
///  deserialized by a receive task before they are dispatched, so local and remote channel ends
///  behave identically apart from latency.
pub struct LoopbackLink {
    id: LinkId,
    node: NodeId,
    outbound: mpsc::UnboundedSender<Message>,
    liveness: Arc<LinkLiveness>,
}

impl LoopbackLink {
    pub fn new(node: NodeId, dispatcher: Arc<dyn MessageDispatcher>) -> Arc<LoopbackLink> {
        let id = LinkId::new_random();
        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        let (wire, wire_recv) = mpsc::unbounded_channel();
        let liveness = Arc::new(LinkLiveness::new(id, dispatcher.clone()));
        let reply_sender = Arc::new(LinkSender::new(id, outbound.clone()));

        let span = info_span!("loopback", link = %id);
        tokio::spawn(transmit_loop(outbound_recv, wire, liveness.clone())
            .instrument(span.clone()));
        tokio::spawn(receive_loop(wire_recv, node, reply_sender, dispatcher, liveness.clone())
            .instrument(span));

        Arc::new(LoopbackLink {
            id,
            node,
            outbound,
            liveness,
        })
    }
}

#[async_trait]
impl Link for LoopbackLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote_node(&self) -> NodeId {
        self.node
    }

    fn specification(&self) -> Specification {
        Specification::loopback()
    }

    async fn transmit(&self, msg: Message) -> anyhow::Result<()> {
        if !self.liveness.is_connected() {
            bail!("loopback link {} is closed", self.id);
        }
        self.outbound.send(msg)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.liveness.is_connected()
    }

    async fn close(&self) {
        self.liveness.terminate().await;
    }

    async fn closed(&self) {
        self.liveness.closed().await
    }
}

async fn transmit_loop(mut outbound: mpsc::UnboundedReceiver<Message>, wire: mpsc::UnboundedSender<Bytes>, liveness: Arc<LinkLiveness>) {
    let mut shutdown = liveness.shutdown_signal();

    loop {
        let msg = select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        if wire.send(buf.freeze()).is_err() {
            break;
        }
    }

    liveness.terminate().await;
}

async fn receive_loop(
    mut wire: mpsc::UnboundedReceiver<Bytes>,
    node: NodeId,
    reply_sender: Arc<LinkSender>,
    dispatcher: Arc<dyn MessageDispatcher>,
    liveness: Arc<LinkLiveness>,
) {
    let mut shutdown = liveness.shutdown_signal();

    loop {
        let mut buf = select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            buf = wire.recv() => match buf {
                Some(buf) => buf,
                None => break,
            },
        };

        match Message::try_deser(&mut buf) {
            Ok(mut msg) => {
                trace!("looping back {:?}", msg);
                msg.source_node = Some(node);
                msg.reply_to = Some(reply_sender.clone());
                dispatcher.on_message(msg).await;
            }
            Err(e) => warn!("loopback message could not be deserialized - skipping: {}", e),
        }
    }

    liveness.terminate().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::message_dispatcher::MockMessageDispatcher;
    use crate::messages::message::{ChannelIndex, MessageBody};
    use crate::messages::serialized::SerializedObject;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_round_trip_is_value_equal() {
        let (received, mut received_recv) = mpsc::unbounded_channel();
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message()
            .returning(move |msg| { received.send(msg).ok(); });

        let node = NodeId { unique: 5 };
        let link = LoopbackLink::new(node, Arc::new(dispatcher));

        let payload: Vec<u8> = (0..=255).collect();
        let sent = Message::data(ChannelIndex(1), ChannelIndex(2), SerializedObject::new(&payload), true);
        link.transmit(sent.clone()).await.unwrap();

        let msg = timeout(Duration::from_secs(1), received_recv.recv()).await.unwrap().unwrap();
        assert_eq!(msg.body, sent.body);
        assert_eq!(msg.dest_index, ChannelIndex(1));
        assert_eq!(msg.source_node, Some(node));
        match msg.body {
            MessageBody::Data { payload: p, .. } => assert_eq!(p.get::<Vec<u8>>().unwrap(), payload),
            other => panic!("unexpected body {:?}", other),
        }

        // replies take the same way back
        assert_reply_loops_back(&mut received_recv, &link).await;
    }

    async fn assert_reply_loops_back(received_recv: &mut mpsc::UnboundedReceiver<Message>, link: &Arc<LoopbackLink>) {
        link.transmit(Message::new(ChannelIndex(3), ChannelIndex(4), MessageBody::Ack)).await.unwrap();
        let msg = timeout(Duration::from_secs(1), received_recv.recv()).await.unwrap().unwrap();
        msg.send_reply(MessageBody::WriteRejected).await;

        let reply = timeout(Duration::from_secs(1), received_recv.recv()).await.unwrap().unwrap();
        assert_eq!(reply.body, MessageBody::WriteRejected);
        assert_eq!(reply.dest_index, ChannelIndex(4));
    }

    #[tokio::test]
    async fn test_close() {
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_link_lost()
            .once()
            .return_const(());

        let link = LoopbackLink::new(NodeId { unique: 5 }, Arc::new(dispatcher));
        link.close().await;
        link.close().await;
        assert!(!link.is_connected());
        assert!(link.transmit(Message::new(ChannelIndex(3), ChannelIndex(4), MessageBody::Ack)).await.is_err());
    }
}
