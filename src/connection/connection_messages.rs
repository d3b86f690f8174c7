use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messages::serialized::{NetSerializable, SerializedObject};
use crate::node::location::NetChannelLocation;


#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum ConnectionMessageKind {
    Open = 1,
    Ping = 2,
    Pong = 3,
    Close = 4,
}

/// What client and server of a connection exchange over their plain network channels.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionMessage {
    /// a client's first request, carrying the location of its reply channel
    Open {
        reply_location: NetChannelLocation,
        payload: SerializedObject,
    },
    /// a further request within an open session
    Ping {
        payload: SerializedObject,
    },
    /// a reply that keeps the session open
    Pong {
        payload: SerializedObject,
    },
    /// a reply that closes the session
    Close {
        payload: SerializedObject,
    },
}

impl ConnectionMessage {
    fn kind(&self) -> ConnectionMessageKind {
        match self {
            ConnectionMessage::Open { .. } => ConnectionMessageKind::Open,
            ConnectionMessage::Ping { .. } => ConnectionMessageKind::Ping,
            ConnectionMessage::Pong { .. } => ConnectionMessageKind::Pong,
            ConnectionMessage::Close { .. } => ConnectionMessageKind::Close,
        }
    }

    pub fn payload(&self) -> &SerializedObject {
        match self {
            ConnectionMessage::Open { payload, .. } => payload,
            ConnectionMessage::Ping { payload } => payload,
            ConnectionMessage::Pong { payload } => payload,
            ConnectionMessage::Close { payload } => payload,
        }
    }
}

impl NetSerializable for ConnectionMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().into());
        if let ConnectionMessage::Open { reply_location, .. } = self {
            reply_location.ser(buf);
        }
        self.payload().ser(buf);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        let kind = match ConnectionMessageKind::try_from(buf.try_get_u8()?) {
            Ok(kind) => kind,
            Err(e) => bail!("invalid connection message kind: {}", e),
        };

        let result = match kind {
            ConnectionMessageKind::Open => {
                let reply_location = NetChannelLocation::try_deser(buf)?;
                ConnectionMessage::Open { reply_location, payload: SerializedObject::try_deser(buf)? }
            }
            ConnectionMessageKind::Ping => ConnectionMessage::Ping { payload: SerializedObject::try_deser(buf)? },
            ConnectionMessageKind::Pong => ConnectionMessage::Pong { payload: SerializedObject::try_deser(buf)? },
            ConnectionMessageKind::Close => ConnectionMessage::Close { payload: SerializedObject::try_deser(buf)? },
        };
        Ok(result)
    }
}
