use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::link::profile::Specification;
use crate::link::protocol::{LinkContext, LinkServer, NodeAddressId, Protocol};
use crate::link::stream_link::StreamLink;
use crate::link::Link;


/// Links over TCP. Addresses have the form `tcp://host:port` (the `tcp://` prefix is optional).
#[derive(Default)]
pub struct TcpProtocol {}

impl TcpProtocol {
    pub const ID: &'static str = "tcp";
    const PREFIX: &'static str = "tcp://";
}

#[async_trait]
impl Protocol for TcpProtocol {
    fn id(&self) -> &str {
        Self::ID
    }

    fn specification(&self) -> Specification {
        Specification::stream(Self::ID)
    }

    fn create_address_id(&self, address: &str, globally_unique: bool) -> anyhow::Result<NodeAddressId> {
        let host_port = address.strip_prefix(Self::PREFIX).unwrap_or(address);

        let (host, port) = host_port.rsplit_once(':')
            .ok_or_else(|| anyhow!("TCP address must have the form host:port: {:?}", address))?;
        if host.is_empty() {
            bail!("TCP address has no host: {:?}", address);
        }
        port.parse::<u16>()
            .map_err(|e| anyhow!("TCP address has an invalid port {:?}: {}", address, e))?;

        Ok(NodeAddressId::new(Self::ID, host_port, globally_unique))
    }

    async fn connect(&self, address: &NodeAddressId, ctx: &LinkContext) -> anyhow::Result<Arc<dyn Link>> {
        if address.protocol() != Self::ID {
            bail!("not a TCP address: {}", address);
        }

        debug!("connecting to {}", address);
        let stream = TcpStream::connect(address.address()).await?;
        stream.set_nodelay(true)?;
        let link: Arc<dyn Link> = StreamLink::establish(stream, ctx, self.specification()).await?;
        Ok(link)
    }

    async fn start_link_server(&self, address: &NodeAddressId, ctx: &LinkContext) -> anyhow::Result<Box<dyn LinkServer>> {
        if address.protocol() != Self::ID {
            bail!("not a TCP address: {}", address);
        }

        let listener = TcpListener::bind(address.address()).await?;
        let local_addr = listener.local_addr()?;
        info!("accepting links on {}", local_addr);

        let accept_loop = tokio::spawn(accept_loop(listener, ctx.clone(), self.specification()));

        let server: Box<dyn LinkServer> = Box::new(TcpLinkServer {
            address: NodeAddressId::new(Self::ID, &local_addr.to_string(), address.is_globally_unique()),
            accept_loop,
        });
        Ok(server)
    }
}

struct TcpLinkServer {
    address: NodeAddressId,
    accept_loop: JoinHandle<()>,
}

#[async_trait]
impl LinkServer for TcpLinkServer {
    fn address(&self) -> &NodeAddressId {
        &self.address
    }

    async fn stop(&self) {
        debug!("stopping link server on {}", self.address);
        self.accept_loop.abort();
    }
}

impl Drop for TcpLinkServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn accept_loop(listener: TcpListener, ctx: LinkContext, specification: Specification) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("error accepting connection: {}", e);
                continue;
            }
        };

        let ctx = ctx.clone();
        let specification = specification.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection_request(addr, stream, ctx, specification).await {
                warn!("connection from {} could not be established as a link: {}", addr, e);
            }
        });
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = format!("{:?}", _addr)))]
async fn handle_connection_request(
    _addr: SocketAddr,
    stream: TcpStream,
    ctx: LinkContext,
    specification: Specification,
) -> anyhow::Result<()> {
    debug!("received connection request");
    stream.set_nodelay(true)?;
    let link = StreamLink::establish(stream, &ctx, specification)
        .instrument(Span::current())
        .await?;
    debug!(link = %link.id(), "link established in server mode");
    ctx.registry.add(link).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::message_dispatcher::MockMessageDispatcher;
    use crate::link::registry::LinkRegistry;
    use crate::node::node_id::NodeId;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case::with_prefix("tcp://localhost:4711", "localhost:4711")]
    #[case::without_prefix("127.0.0.1:80", "127.0.0.1:80")]
    #[case::ipv6("tcp://[::1]:80", "[::1]:80")]
    fn test_create_address_id(#[case] s: &str, #[case] expected: &str) {
        let address = TcpProtocol::default().create_address_id(s, true).unwrap();
        assert_eq!(address.address(), expected);
        assert_eq!(address.protocol(), "tcp");
        assert_eq!(address.to_string(), format!("tcp://{}", expected));
    }

    #[rstest]
    #[case::no_port("tcp://localhost")]
    #[case::bad_port("tcp://localhost:http")]
    #[case::port_out_of_range("localhost:70000")]
    #[case::no_host(":80")]
    fn test_create_address_id_malformed(#[case] s: &str) {
        assert!(TcpProtocol::default().create_address_id(s, true).is_err());
    }

    fn link_context(node: u64) -> LinkContext {
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message().return_const(());
        dispatcher.expect_on_link_lost().return_const(());

        LinkContext {
            self_node: NodeId { unique: node },
            dispatcher: Arc::new(dispatcher),
            registry: Arc::new(LinkRegistry::default()),
            max_frame_len: 1024,
        }
    }

    #[tokio::test]
    async fn test_connect_to_link_server() {
        let protocol = TcpProtocol::default();
        let server_ctx = link_context(1);
        let client_ctx = link_context(2);

        let bind_address = protocol.create_address_id("tcp://127.0.0.1:0", false).unwrap();
        let server = protocol.start_link_server(&bind_address, &server_ctx).await.unwrap();
        assert_ne!(server.address().address(), "127.0.0.1:0");

        let link = protocol.connect(server.address(), &client_ctx).await.unwrap();
        assert_eq!(link.remote_node(), NodeId { unique: 1 });
        assert_eq!(link.specification().protocol, "tcp");

        // the server side registers its end of the link
        for _ in 0..100 {
            if server_ctx.registry.get(NodeId { unique: 2 }, None).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server_ctx.registry.get(NodeId { unique: 2 }, None).await.is_some());

        server.stop().await;
        link.close().await;
    }
}
