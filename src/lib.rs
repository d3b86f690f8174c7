//! Networked CSP channels: typed channel ends whose reader and writer live on different nodes,
//!  multiplexed over links between the nodes.
//!
//! A node is represented by an explicitly constructed [node::context::NodeContext]. Network
//!  inputs ([channels::net_input::Net2One], [channels::net_input::Net2Any]) register with the
//!  node's index table, and output ends ([channels::net_output::One2Net],
//!  [channels::net_output::Any2Net]) write to them through a link, by default waiting for an
//!  acknowledgement.

pub mod channels;
pub mod connection;
pub mod index;
pub mod link;
pub mod messages;
pub mod node;
pub mod util;
pub mod test_util;
