use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, warn};

use crate::link::LinkId;
use crate::messages::serialized::SerializedObject;
use crate::node::node_id::NodeId;
use crate::util::buf::{put_bool, put_string, try_get_bool, try_get_string};


/// The per-node number identifying a network addressable channel end ('virtual channel number').
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChannelIndex(pub i64);

impl ChannelIndex {
    pub const INVALID: ChannelIndex = ChannelIndex(-1);

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl Debug for ChannelIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for ChannelIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// Where replies to a received message go. Links implement this for messages that arrived over
///  them, and local inboxes implement it for locally generated notices.
#[async_trait]
pub trait ReplySink: Send + Sync + 'static {
    async fn reply(&self, msg: Message) -> anyhow::Result<()>;
}


#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum MessageKind {
    Data = 1,
    Ack = 2,
    WriteRejected = 3,
    LinkLost = 4,
    LabelLookup = 5,
    LabelLookupReply = 6,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessageBody {
    Data {
        payload: SerializedObject,
        acknowledged: bool,
    },
    Ack,
    /// sent instead of an `Ack` if the destination channel does not exist (any more)
    WriteRejected,
    /// Generated locally when a link fails. It is broadcast to plain input channels, which
    ///  acknowledge it to the reply sink attached to the notice.
    LinkLost {
        link: LinkId,
    },
    LabelLookup {
        label: String,
    },
    /// `ChannelIndex::INVALID` if the label is not registered
    LabelLookupReply {
        index: ChannelIndex,
    },
}

impl MessageBody {
    fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Data { .. } => MessageKind::Data,
            MessageBody::Ack => MessageKind::Ack,
            MessageBody::WriteRejected => MessageKind::WriteRejected,
            MessageBody::LinkLost { .. } => MessageKind::LinkLost,
            MessageBody::LabelLookup { .. } => MessageKind::LabelLookup,
            MessageBody::LabelLookupReply { .. } => MessageKind::LabelLookupReply,
        }
    }
}


/// The envelope for everything that travels between channel ends.
///
/// Wire format - all numbers in network byte order (BE):
/// ```ascii
/// 0:  kind (u8)
/// 1:  destination index (i64)
/// 9:  source index (i64)
/// 17: body, depending on kind:
///     * Data: acknowledged (u8 0/1), payload bytes (varint length + bytes), payload display string
///     * LinkLost: link id (u128)
///     * LabelLookup: label (varint length + UTF-8)
///     * LabelLookupReply: index (i64)
///     * Ack, WriteRejected: nothing
/// ```
///
/// `source_node` and `reply_to` are filled in by the receiving link and are never serialized.
#[derive(Clone)]
pub struct Message {
    pub dest_index: ChannelIndex,
    pub source_index: ChannelIndex,
    pub body: MessageBody,
    pub source_node: Option<NodeId>,
    pub reply_to: Option<Arc<dyn ReplySink>>,
}

impl Message {
    pub fn new(dest_index: ChannelIndex, source_index: ChannelIndex, body: MessageBody) -> Message {
        Message {
            dest_index,
            source_index,
            body,
            source_node: None,
            reply_to: None,
        }
    }

    pub fn data(dest_index: ChannelIndex, source_index: ChannelIndex, payload: SerializedObject, acknowledged: bool) -> Message {
        Self::new(dest_index, source_index, MessageBody::Data { payload, acknowledged })
    }

    pub fn wants_ack(&self) -> bool {
        matches!(self.body, MessageBody::Data { acknowledged: true, .. })
    }

    /// a message going back to where this message came from
    pub fn reply_message(&self, body: MessageBody) -> Message {
        Message::new(self.source_index, self.dest_index, body)
    }

    /// Sends a reply through the sink this message arrived with. Replies are best effort at this
    ///  level: if the way back is gone, the sender learns about it through link loss.
    pub async fn send_reply(&self, body: MessageBody) {
        match &self.reply_to {
            Some(sink) => {
                if let Err(e) = sink.reply(self.reply_message(body)).await {
                    debug!("could not send reply to {:?}@{:?}: {}", self.source_index, self.source_node, e);
                }
            }
            None => warn!("message {:?} has no reply channel - dropping reply {:?}", self, body),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.body.kind().into());
        buf.put_i64(self.dest_index.0);
        buf.put_i64(self.source_index.0);

        match &self.body {
            MessageBody::Data { payload, acknowledged } => {
                put_bool(buf, *acknowledged);
                payload.ser(buf);
            }
            MessageBody::Ack | MessageBody::WriteRejected => {}
            MessageBody::LinkLost { link } => link.ser(buf),
            MessageBody::LabelLookup { label } => put_string(buf, label),
            MessageBody::LabelLookupReply { index } => buf.put_i64(index.0),
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let kind = MessageKind::try_from(buf.try_get_u8()?)?;
        let dest_index = ChannelIndex(buf.try_get_i64()?);
        let source_index = ChannelIndex(buf.try_get_i64()?);

        let body = match kind {
            MessageKind::Data => {
                let acknowledged = try_get_bool(buf)?;
                let payload = SerializedObject::try_deser(buf)?;
                MessageBody::Data { payload, acknowledged }
            }
            MessageKind::Ack => MessageBody::Ack,
            MessageKind::WriteRejected => MessageBody::WriteRejected,
            MessageKind::LinkLost => MessageBody::LinkLost { link: LinkId::try_deser(buf)? },
            MessageKind::LabelLookup => MessageBody::LabelLookup { label: try_get_string(buf)? },
            MessageKind::LabelLookupReply => MessageBody::LabelLookupReply { index: ChannelIndex(buf.try_get_i64()?) },
        };

        Ok(Message::new(dest_index, source_index, body))
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{{:?} -> {:?}: {:?}", self.source_index, self.dest_index, self.body)?;
        if let Some(node) = &self.source_node {
            write!(f, " from {:?}", node)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ser(msg: &Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        buf.to_vec()
    }

    #[rstest]
    #[case::ack(Message::new(ChannelIndex(2), ChannelIndex(5), MessageBody::Ack), vec![2, 0,0,0,0,0,0,0,2, 0,0,0,0,0,0,0,5])]
    #[case::rejected(Message::new(ChannelIndex(1), ChannelIndex(0), MessageBody::WriteRejected), vec![3, 0,0,0,0,0,0,0,1, 0,0,0,0,0,0,0,0])]
    #[case::invalid_source(Message::new(ChannelIndex(1), ChannelIndex::INVALID, MessageBody::LabelLookup { label: "ab".to_string() }),
        vec![5, 0,0,0,0,0,0,0,1, 255,255,255,255,255,255,255,255, 2, b'a', b'b'])]
    #[case::lookup_reply(Message::new(ChannelIndex(3), ChannelIndex(4), MessageBody::LabelLookupReply { index: ChannelIndex(9) }),
        vec![6, 0,0,0,0,0,0,0,3, 0,0,0,0,0,0,0,4, 0,0,0,0,0,0,0,9])]
    fn test_ser(#[case] msg: Message, #[case] expected: Vec<u8>) {
        assert_eq!(ser(&msg), expected);

        let deser = Message::try_deser(&mut expected.as_slice()).unwrap();
        assert_eq!(deser.dest_index, msg.dest_index);
        assert_eq!(deser.source_index, msg.source_index);
        assert_eq!(deser.body, msg.body);
    }

    #[test]
    fn test_data_keeps_payload_and_flag() {
        let msg = Message::data(ChannelIndex(7), ChannelIndex(8), SerializedObject::new(&"ping".to_string()), true);
        let raw = ser(&msg);
        assert_eq!(raw[17], 1);

        let deser = Message::try_deser(&mut raw.as_slice()).unwrap();
        assert!(deser.wants_ack());
        assert!(deser.source_node.is_none());
        match deser.body {
            MessageBody::Data { payload, .. } => assert_eq!(payload.get::<String>().unwrap(), "ping"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[rstest]
    #[case::unknown_kind(vec![99, 0,0,0,0,0,0,0,3, 0,0,0,0,0,0,0,4])]
    #[case::truncated(vec![2, 0,0,0,0,0,0,0,3, 0,0,0])]
    #[case::empty(vec![])]
    fn test_deser_malformed(#[case] raw: Vec<u8>) {
        assert!(Message::try_deser(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_reply_message_swaps_indices() {
        let msg = Message::data(ChannelIndex(7), ChannelIndex(8), SerializedObject::empty(), true);
        let reply = msg.reply_message(MessageBody::Ack);
        assert_eq!(reply.dest_index, ChannelIndex(8));
        assert_eq!(reply.source_index, ChannelIndex(7));
    }
}
