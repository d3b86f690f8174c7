use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channels::error::{ChannelError, ChannelResult};
use crate::channels::net_input::Net2One;
use crate::channels::net_output::One2Net;
use crate::connection::connection_messages::ConnectionMessage;
use crate::messages::serialized::{NetSerializable, SerializedObject};
use crate::node::context::NodeContext;
use crate::node::location::NetConnectionLocation;


/// The server end of a request / reply connection. It serves one session at a time: while a
///  session is open, only that client's further requests are read, and other clients wait in
///  the open channel.
pub struct NetConnectionServer<Req, Rep> {
    ctx: Arc<NodeContext>,
    open_in: Net2One<ConnectionMessage>,
    request_in: Net2One<ConnectionMessage>,
    /// the current session's reply channel
    reply_out: Option<One2Net<ConnectionMessage>>,
    location: NetConnectionLocation,
    destroyed: bool,
    _payload: PhantomData<fn(&Rep) -> Req>,
}

impl<Req: NetSerializable, Rep: NetSerializable> NetConnectionServer<Req, Rep> {
    pub async fn new(ctx: &Arc<NodeContext>) -> ChannelResult<NetConnectionServer<Req, Rep>> {
        Self::create(ctx, Net2One::new(ctx).await?).await
    }

    /// a server whose open channel can be found by `label`
    pub async fn labelled(ctx: &Arc<NodeContext>, label: &str) -> ChannelResult<NetConnectionServer<Req, Rep>> {
        Self::create(ctx, Net2One::labelled(ctx, label).await?).await
    }

    async fn create(ctx: &Arc<NodeContext>, open_in: Net2One<ConnectionMessage>) -> ChannelResult<NetConnectionServer<Req, Rep>> {
        let request_in = Net2One::new(ctx).await?;
        let location = NetConnectionLocation {
            open: open_in.location().clone(),
            request: request_in.location().clone(),
        };

        debug!(open = %location.open, request = %location.request, "created connection server");
        Ok(NetConnectionServer {
            ctx: ctx.clone(),
            open_in,
            request_in,
            reply_out: None,
            location,
            destroyed: false,
            _payload: PhantomData,
        })
    }

    pub fn location(&self) -> &NetConnectionLocation {
        &self.location
    }

    pub fn is_session_open(&self) -> bool {
        self.reply_out.is_some()
    }

    /// Waits for the next request: the next `Open` if no session is open, else the current
    ///  client's next request.
    pub async fn request(&mut self) -> ChannelResult<Req> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }

        loop {
            if self.reply_out.is_none() {
                match self.open_in.read().await? {
                    ConnectionMessage::Open { reply_location, payload } => {
                        match One2Net::new(&self.ctx, reply_location.clone()).await {
                            Ok(reply_out) => self.reply_out = Some(reply_out),
                            Err(e) => {
                                // the client is told by its own link loss, if at all
                                warn!("can not reach the reply channel {} of a new session: {} - dropping the session", reply_location, e);
                                return Err(e);
                            }
                        }
                        return payload.get().map_err(ChannelError::serialization);
                    }
                    other => warn!("unexpected message on a connection's open channel: {:?}", other),
                }
            }
            else {
                match self.request_in.read().await? {
                    ConnectionMessage::Ping { payload } => return payload.get().map_err(ChannelError::serialization),
                    other => warn!("unexpected message on a connection's request channel: {:?}", other),
                }
            }
        }
    }

    /// replies to the current request, keeping the session open
    pub async fn reply(&mut self, value: &Rep) -> ChannelResult<()> {
        let reply_out = self.reply_out.as_mut()
            .ok_or(ChannelError::Destroyed)?;
        reply_out.write(&ConnectionMessage::Pong { payload: SerializedObject::new(value) }).await
    }

    /// replies to the current request and closes the session
    pub async fn reply_and_close(&mut self, value: &Rep) -> ChannelResult<()> {
        let mut reply_out = self.reply_out.take()
            .ok_or(ChannelError::Destroyed)?;
        let result = reply_out.write(&ConnectionMessage::Close { payload: SerializedObject::new(value) }).await;
        reply_out.destroy_writer().await;
        result
    }

    /// Releases the server's channels. Calling this more than once has no further effect.
    pub async fn destroy_server(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(mut reply_out) = self.reply_out.take() {
            reply_out.destroy_writer().await;
        }
        self.open_in.destroy_reader().await;
        self.request_in.destroy_reader().await;
        debug!("destroyed connection server");
    }
}
