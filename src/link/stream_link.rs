//! A link over any reliable, ordered byte stream (TCP, in-memory pipes, ...).
//!
//! After a handshake exchanging node ids, each envelope travels as a frame (numbers in network
//!  byte order):
//!
//! ```ascii
//! 0:  envelope length (u32)
//! 4:  CRC-64 checksum of the envelope (u64)
//! 12: envelope (see `Message`)
//! ```
//!
//! Anything unexpected on the stream (oversized frame, checksum mismatch, malformed envelope)
//!  terminates the link: the stream can not be trusted to be in sync any more.

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::link::message_dispatcher::MessageDispatcher;
use crate::link::profile::Specification;
use crate::link::protocol::LinkContext;
use crate::link::{wait_for_shutdown, Link, LinkId, LinkLiveness, LinkSender};
use crate::messages::message::Message;
use crate::node::node_id::NodeId;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};


const CHECKSUM: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_REDIS);

/// the first thing either side sends on a new stream
struct HandshakeMsg {
    node: NodeId,
}
impl HandshakeMsg {
    const MAGIC: u32 = 0x4e43_4c4b;
    const SERIALIZED_LEN: usize = 12;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(Self::MAGIC);
        self.node.ser(buf);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<HandshakeMsg> {
        let magic = buf.try_get_u32()?;
        if magic != Self::MAGIC {
            bail!("peer is not speaking this protocol: magic number {:x}", magic);
        }
        Ok(HandshakeMsg {
            node: NodeId::try_deser(buf)?,
        })
    }
}

async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, self_node: NodeId) -> anyhow::Result<NodeId> {
    let mut buf = BytesMut::new();
    HandshakeMsg { node: self_node }.ser(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut raw = [0u8; HandshakeMsg::SERIALIZED_LEN];
    stream.read_exact(&mut raw).await?;
    Ok(HandshakeMsg::deser(&mut raw.as_ref())?.node)
}

fn encode_envelope(msg: &Message, max_frame_len: usize) -> anyhow::Result<BytesMut> {
    let mut envelope = BytesMut::new();
    msg.ser(&mut envelope);

    if envelope.len() > max_frame_len {
        bail!("message of {} bytes exceeds the maximum frame length of {}", envelope.len(), max_frame_len);
    }
    Ok(envelope)
}

pub fn encode_frame(msg: &Message, max_frame_len: usize, buf: &mut BytesMut) -> anyhow::Result<()> {
    let envelope = encode_envelope(msg, max_frame_len)?;

    let len: u32 = envelope.len().prechecked_cast();
    buf.put_u32(len);
    buf.put_u64(CHECKSUM.checksum(&envelope));
    buf.extend_from_slice(&envelope);
    Ok(())
}

/// `None` if the stream was closed cleanly between frames
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_len: usize) -> anyhow::Result<Option<Message>> {
    let len: usize = match reader.read_u32().await {
        Ok(len) => len.safe_cast(),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame_len {
        bail!("received a frame of {} bytes, exceeding the maximum of {} - the stream is apparently corrupt", len, max_frame_len);
    }

    let checksum = reader.read_u64().await?;
    let mut envelope = vec![0u8; len];
    reader.read_exact(&mut envelope).await?;

    if CHECKSUM.checksum(&envelope) != checksum {
        bail!("checksum mismatch");
    }

    let mut buf = envelope.as_slice();
    let msg = Message::try_deser(&mut buf)?;
    if !buf.is_empty() {
        bail!("{} trailing bytes after envelope", buf.len());
    }
    Ok(Some(msg))
}


pub struct StreamLink {
    id: LinkId,
    remote_node: NodeId,
    specification: Specification,
    outbound: mpsc::UnboundedSender<Message>,
    liveness: Arc<LinkLiveness>,
    max_frame_len: usize,
}

impl StreamLink {
    /// Performs the handshake on `stream` and starts the link's transmit and receive tasks. The
    ///  link is not registered with the node - that is up to the caller.
    pub async fn establish<S>(mut stream: S, ctx: &LinkContext, specification: Specification) -> anyhow::Result<Arc<StreamLink>>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let remote_node = handshake(&mut stream, ctx.self_node).await?;
        let id = LinkId::new_random();
        debug!(link = %id, remote = ?remote_node, "handshake complete");

        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        let liveness = Arc::new(LinkLiveness::new(id, ctx.dispatcher.clone()));
        let reply_sender = Arc::new(LinkSender::new(id, outbound.clone()));

        let span = info_span!("link", link = %id, remote = ?remote_node);
        tokio::spawn(transmit_loop(writer, outbound_recv, liveness.clone(), ctx.max_frame_len)
            .instrument(span.clone()));
        tokio::spawn(receive_loop(reader, remote_node, reply_sender, ctx.dispatcher.clone(), liveness.clone(), ctx.max_frame_len)
            .instrument(span));

        Ok(Arc::new(StreamLink {
            id,
            remote_node,
            specification,
            outbound,
            liveness,
            max_frame_len: ctx.max_frame_len,
        }))
    }
}

#[async_trait]
impl Link for StreamLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote_node(&self) -> NodeId {
        self.remote_node
    }

    fn specification(&self) -> Specification {
        self.specification.clone()
    }

    async fn transmit(&self, msg: Message) -> anyhow::Result<()> {
        if !self.liveness.is_connected() {
            bail!("link {} is closed", self.id);
        }
        // the transmit task treats a frame it can not encode as fatal to the link
        encode_envelope(&msg, self.max_frame_len)?;

        trace!(link = %self.id, "transmitting {:?}", msg);
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

async fn transmit_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    liveness: Arc<LinkLiveness>,
    max_frame_len: usize,
) {
    let mut shutdown = liveness.shutdown_signal();
    let mut buf = BytesMut::new();

    loop {
        let msg = select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        buf.clear();
        if let Err(e) = encode_frame(&msg, max_frame_len, &mut buf) {
            warn!("can not send {:?}: {} - closing link", msg, e);
            break;
        }
        if let Err(e) = write_frame(&mut writer, &buf).await {
            debug!("error writing to stream: {}", e);
            break;
        }
    }

    writer.shutdown().await.ok();
    liveness.terminate().await;
}

async fn write_frame<S: AsyncWrite>(writer: &mut WriteHalf<S>, buf: &[u8]) -> anyhow::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn receive_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    remote_node: NodeId,
    reply_sender: Arc<LinkSender>,
    dispatcher: Arc<dyn MessageDispatcher>,
    liveness: Arc<LinkLiveness>,
    max_frame_len: usize,
) {
    let mut shutdown = liveness.shutdown_signal();

    loop {
        let frame = select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            frame = read_frame(&mut reader, max_frame_len) => frame,
        };

        match frame {
            Ok(Some(mut msg)) => {
                trace!("received {:?}", msg);
                msg.source_node = Some(remote_node);
                msg.reply_to = Some(reply_sender.clone());
                dispatcher.on_message(msg).await;
            }
            Ok(None) => {
                debug!("peer closed the stream");
                break;
            }
            Err(e) => {
                warn!("error receiving from stream - closing link: {}", e);
                break;
            }
        }
    }

    liveness.terminate().await;
}
