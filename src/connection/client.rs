use std::marker::PhantomData;
use std::sync::Arc;

use tokio::select;
use tracing::{debug, warn};

use crate::channels::error::{ChannelError, ChannelResult};
use crate::channels::net_input::Net2One;
use crate::channels::net_output::One2Net;
use crate::connection::connection_messages::ConnectionMessage;
use crate::messages::serialized::{NetSerializable, SerializedObject};
use crate::node::context::NodeContext;
use crate::node::location::NetConnectionLocation;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientState {
    /// no session was opened yet
    Unopened,
    /// a request was sent, and the server has not closed the session
    Open,
    /// the server closed the last session; the next request opens a new one
    Closed,
}

/// The client end of a request / reply connection.
///
/// The first request of a session goes to the server's open channel and carries the location of
///  this client's reply channel; further requests in the same session go to the server's request
///  channel. Each reply either keeps the session open or closes it.
pub struct NetConnectionClient<Req, Rep> {
    open_out: One2Net<ConnectionMessage>,
    request_out: One2Net<ConnectionMessage>,
    reply_in: Net2One<ConnectionMessage>,
    state: ClientState,
    destroyed: bool,
    _payload: PhantomData<fn(&Req) -> Rep>,
}

impl<Req: NetSerializable, Rep: NetSerializable> NetConnectionClient<Req, Rep> {
    pub async fn new(ctx: &Arc<NodeContext>, server: &NetConnectionLocation) -> ChannelResult<NetConnectionClient<Req, Rep>> {
        let reply_in = Net2One::new(ctx).await?;
        let open_out = One2Net::new(ctx, server.open.clone()).await?;
        let request_out = One2Net::new(ctx, server.request.clone()).await?;

        debug!(server = %server.open, reply = %reply_in.location(), "created connection client");
        Ok(NetConnectionClient {
            open_out,
            request_out,
            reply_in,
            state: ClientState::Unopened,
            destroyed: false,
            _payload: PhantomData,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ClientState::Open
    }

    /// Sends a request, opening a session if none is open. Returns once the server took it.
    pub async fn request(&mut self, value: &Req) -> ChannelResult<()> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }

        let payload = SerializedObject::new(value);
        match self.state {
            ClientState::Unopened | ClientState::Closed => {
                let msg = ConnectionMessage::Open {
                    reply_location: self.reply_in.location().clone(),
                    payload,
                };
                self.open_out.write(&msg).await?;
                self.state = ClientState::Open;
            }
            ClientState::Open => {
                self.request_out.write(&ConnectionMessage::Ping { payload }).await?;
            }
        }
        Ok(())
    }

    /// Waits for the server's reply to the last request. Losing the link to the server closes
    ///  the session, since its reply can no longer arrive.
    pub async fn reply(&mut self) -> ChannelResult<Rep> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }

        loop {
            let received = select! {
                biased;
                msg = self.reply_in.read() => Ok(msg),
                lost = self.open_out.link_lost() => Err(lost),
            };
            let msg = match received {
                Ok(msg) => msg?,
                Err(lost) => {
                    debug!("lost the link to the server while waiting for a reply: {}", lost);
                    self.state = ClientState::Closed;
                    return Err(lost);
                }
            };
            let payload = match msg {
                ConnectionMessage::Pong { payload } => payload,
                ConnectionMessage::Close { payload } => {
                    self.state = ClientState::Closed;
                    payload
                }
                other => {
                    warn!("unexpected message on a connection's reply channel: {:?}", other);
                    continue;
                }
            };
            return payload.get().map_err(ChannelError::serialization);
        }
    }

    /// Releases the client's channels. Calling this more than once has no further effect.
    pub async fn destroy_client(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.open_out.destroy_writer().await;
        self.request_out.destroy_writer().await;
        self.reply_in.destroy_reader().await;
        debug!("destroyed connection client");
    }
}
