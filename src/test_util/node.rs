use std::sync::Arc;

use crate::link::Link;
use crate::node::config::NodeConfig;
use crate::node::context::NodeContext;


/// Two nodes joined by a link over an in-memory byte stream
pub struct NodePair {
    pub a: Arc<NodeContext>,
    pub b: Arc<NodeContext>,
    /// a's end of the link
    pub link_a: Arc<dyn Link>,
    /// b's end of the link
    pub link_b: Arc<dyn Link>,
}

impl NodePair {
    pub async fn new() -> anyhow::Result<NodePair> {
        Self::with_config(NodeConfig::new("a"), NodeConfig::new("b")).await
    }

    pub async fn with_config(config_a: NodeConfig, config_b: NodeConfig) -> anyhow::Result<NodePair> {
        let a = NodeContext::new(config_a)?;
        let b = NodeContext::new(config_b)?;

        let (stream_a, stream_b) = tokio::io::duplex(64*1024);
        let (link_a, link_b) = tokio::try_join!(
            a.attach_stream(stream_a),
            b.attach_stream(stream_b),
        )?;

        Ok(NodePair { a, b, link_a, link_b })
    }

    pub async fn shutdown(&self) {
        self.a.shutdown().await;
        self.b.shutdown().await;
    }
}
