use thiserror::Error;

use crate::link::LinkId;
use crate::messages::message::ChannelIndex;
use crate::node::node_id::NodeId;


/// The terminal outcomes of a channel operation that callers are expected to tell apart.
///
/// Plumbing below the channel surface (codecs, handshakes, socket I/O) uses `anyhow`; failures
///  from there surface as `Link` or `Serialization`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("write was rejected: the destination channel does not exist (any more)")]
    WriteRejected,
    #[error("link {0} was lost")]
    LinkLost(LinkId),
    #[error("channel is poisoned")]
    Poisoned,
    #[error("label {0:?} is already in use")]
    DuplicateLabel(String),
    #[error("channel index {0} is already in use")]
    IndexInUse(ChannelIndex),
    #[error("no channel is registered with label {0:?}")]
    UnknownLabel(String),
    #[error("there is no route to node {0}")]
    NoRoute(NodeId),
    #[error("channel end was destroyed")]
    Destroyed,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("link error: {0}")]
    Link(String),
}

impl ChannelError {
    pub fn link(e: anyhow::Error) -> ChannelError {
        ChannelError::Link(e.to_string())
    }

    pub fn serialization(e: anyhow::Error) -> ChannelError {
        ChannelError::Serialization(e.to_string())
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
