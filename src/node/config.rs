use anyhow::bail;

use crate::node::node_id::DomainId;


#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// for diagnostics, it has no influence on addressing
    pub name: String,
    pub domain: DomainId,

    /// Whether output ends wait for the receiver's acknowledgement unless explicitly created as
    ///  unacknowledged.
    ///
    /// NB: Unacknowledged writes have no delivery confirmation and no backpressure: a writer can
    ///      fill a link's transmit queue without bounds.
    pub default_acknowledged: bool,

    /// maximum envelope size on stream links. Bigger messages terminate the link.
    pub max_frame_len: usize,

    /// initial number of slots in the buffer of each network channel end; buffers grow as needed
    pub initial_inbox_capacity: usize,
}

impl NodeConfig {
    pub fn new(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            domain: DomainId::null_domain(),
            default_acknowledged: true,
            max_frame_len: 16*1024*1024,
            initial_inbox_capacity: 8,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("node name must not be empty");
        }
        if self.max_frame_len < 64 {
            bail!("maximum frame length of {} is too small to hold a message envelope", self.max_frame_len);
        }
        if self.max_frame_len > u32::MAX as usize {
            bail!("maximum frame length of {} does not fit into a frame header", self.max_frame_len);
        }
        if self.initial_inbox_capacity == 0 {
            bail!("initial inbox capacity must be at least 1");
        }
        Ok(())
    }
}
