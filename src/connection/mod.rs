//! Request / reply sessions built from plain network channels: a server has an open channel and a
//!  request channel, each client has a reply channel.

pub mod client;
pub mod connection_messages;
pub mod server;
pub mod shared;
