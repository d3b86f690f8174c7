use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};

use crate::messages::message::ChannelIndex;
use crate::node::node_id::NodeId;
use crate::util::buf::{put_string, try_get_string};


#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChannelTarget {
    Index(ChannelIndex),
    /// resolved to an index on the target node when an output end binds to it
    Label(String),
}

/// The wire transmissible address of a network channel's input end.
///
/// String forms: `ChannelID:<index>:<node>` and `ChannelLabel:<label>:<node>`, where `<node>` is
///  the node id's string form (`Node:<hex>`).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NetChannelLocation {
    pub node: NodeId,
    pub target: ChannelTarget,
}

impl NetChannelLocation {
    const INDEX_PREFIX: &'static str = "ChannelID:";
    const LABEL_PREFIX: &'static str = "ChannelLabel:";

    const KIND_INDEX: u8 = 0;
    const KIND_LABEL: u8 = 1;

    pub fn new(node: NodeId, index: ChannelIndex) -> NetChannelLocation {
        NetChannelLocation {
            node,
            target: ChannelTarget::Index(index),
        }
    }

    pub fn labelled(node: NodeId, label: &str) -> NetChannelLocation {
        NetChannelLocation {
            node,
            target: ChannelTarget::Label(label.to_string()),
        }
    }

    pub fn index(&self) -> Option<ChannelIndex> {
        match &self.target {
            ChannelTarget::Index(index) => Some(*index),
            ChannelTarget::Label(_) => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match &self.target {
            ChannelTarget::Index(_) => None,
            ChannelTarget::Label(label) => Some(label),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.node.ser(buf);
        match &self.target {
            ChannelTarget::Index(index) => {
                buf.put_u8(Self::KIND_INDEX);
                buf.put_i64(index.0);
            }
            ChannelTarget::Label(label) => {
                buf.put_u8(Self::KIND_LABEL);
                put_string(buf, label);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NetChannelLocation> {
        let node = NodeId::try_deser(buf)?;
        let target = match buf.try_get_u8()? {
            Self::KIND_INDEX => ChannelTarget::Index(ChannelIndex(buf.try_get_i64()?)),
            Self::KIND_LABEL => ChannelTarget::Label(try_get_string(buf)?),
            n => bail!("invalid channel location kind {}", n),
        };
        Ok(NetChannelLocation { node, target })
    }
}

impl Display for NetChannelLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            ChannelTarget::Index(index) => write!(f, "{}{}:{}", Self::INDEX_PREFIX, index, self.node),
            ChannelTarget::Label(label) => write!(f, "{}{}:{}", Self::LABEL_PREFIX, label, self.node),
        }
    }
}

impl FromStr for NetChannelLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(Self::INDEX_PREFIX) {
            let (index, node) = rest.split_once(':')
                .ok_or_else(|| anyhow!("channel id {:?} has no node part", s))?;
            let index: i64 = index.parse()
                .map_err(|e| anyhow!("channel id {:?} has an invalid index: {}", s, e))?;
            if index < 0 {
                bail!("channel id {:?} has a negative index", s);
            }
            return Ok(NetChannelLocation::new(NodeId::from_str(node)?, ChannelIndex(index)));
        }

        if let Some(rest) = s.strip_prefix(Self::LABEL_PREFIX) {
            // labels may contain ':', node ids have a fixed prefix
            let pos = rest.rfind(":Node:")
                .ok_or_else(|| anyhow!("channel label {:?} has no node part", s))?;
            let (label, node) = (&rest[..pos], &rest[pos + 1..]);
            if label.is_empty() {
                bail!("channel label {:?} has an empty label", s);
            }
            return Ok(NetChannelLocation::labelled(NodeId::from_str(node)?, label));
        }

        bail!("not a channel location: {:?}", s)
    }
}


/// The address of a connection server: first contact goes to `open`, everything else a client
///  sends in the same session goes to `request`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NetConnectionLocation {
    pub open: NetChannelLocation,
    pub request: NetChannelLocation,
}
