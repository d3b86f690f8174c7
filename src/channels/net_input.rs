use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channels::delivery::DeliveryHandle;
use crate::channels::error::{ChannelError, ChannelResult};
use crate::channels::local_channel::LocalReader;
use crate::messages::message::ChannelIndex;
use crate::messages::serialized::NetSerializable;
use crate::node::context::NodeContext;
use crate::node::location::NetChannelLocation;


struct InputEnd<T> {
    reader: LocalReader<T>,
    delivery: Arc<DeliveryHandle>,
}

impl<T: NetSerializable> InputEnd<T> {
    async fn read(&mut self) -> ChannelResult<T> {
        if self.delivery.is_broken() {
            return Err(ChannelError::Destroyed);
        }
        self.reader.read().await
    }
}

impl<T> Drop for InputEnd<T> {
    fn drop(&mut self) {
        self.delivery.break_on_drop();
    }
}

async fn create_input<T: NetSerializable>(ctx: &Arc<NodeContext>, label: Option<&str>, index: Option<ChannelIndex>) -> ChannelResult<(InputEnd<T>, NetChannelLocation)> {
    let (delivery, reader) = DeliveryHandle::start(ctx.table(), label, index).await?;
    let location = NetChannelLocation::new(ctx.node_id(), delivery.index());
    Ok((InputEnd { reader, delivery }, location))
}


/// The network addressable input end of a channel with a single reader.
///
/// Remote (or local) output ends write to it through its `location()`. Dropping it tears it
///  down like `destroy_reader`, but in the background.
pub struct Net2One<T> {
    end: InputEnd<T>,
    location: NetChannelLocation,
    label: Option<String>,
}

impl<T: NetSerializable> Net2One<T> {
    pub async fn new(ctx: &Arc<NodeContext>) -> ChannelResult<Net2One<T>> {
        let (end, location) = create_input(ctx, None, None).await?;
        Ok(Net2One { end, location, label: None })
    }

    /// an input that can be found on its node by `label`, which must be unique on that node
    pub async fn labelled(ctx: &Arc<NodeContext>, label: &str) -> ChannelResult<Net2One<T>> {
        let (end, location) = create_input(ctx, Some(label), None).await?;
        Ok(Net2One { end, location, label: Some(label.to_string()) })
    }

    /// an input at a well-known index
    pub async fn with_index(ctx: &Arc<NodeContext>, index: ChannelIndex) -> ChannelResult<Net2One<T>> {
        let (end, location) = create_input(ctx, None, Some(index)).await?;
        Ok(Net2One { end, location, label: None })
    }

    /// Waits for the next value written to this channel.
    pub async fn read(&mut self) -> ChannelResult<T> {
        self.end.read().await
    }

    pub fn location(&self) -> &NetChannelLocation {
        &self.location
    }

    pub fn index(&self) -> ChannelIndex {
        self.end.delivery.index()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Tears the input down. Writes that are in flight or arrive later are rejected.
    pub async fn destroy_reader(&mut self) {
        self.end.delivery.break_channel().await;
    }
}


/// The network addressable input end of a channel that any number of local tasks read from.
///
/// Clones share the same input. It is torn down when `destroy_reader` is called or the last
///  clone is dropped.
pub struct Net2Any<T> {
    end: Arc<Mutex<InputEnd<T>>>,
    delivery: Arc<DeliveryHandle>,
    location: NetChannelLocation,
}

impl<T> Clone for Net2Any<T> {
    fn clone(&self) -> Self {
        Net2Any {
            end: self.end.clone(),
            delivery: self.delivery.clone(),
            location: self.location.clone(),
        }
    }
}

impl<T: NetSerializable> Net2Any<T> {
    pub async fn new(ctx: &Arc<NodeContext>) -> ChannelResult<Net2Any<T>> {
        Self::create(ctx, None).await
    }

    pub async fn labelled(ctx: &Arc<NodeContext>, label: &str) -> ChannelResult<Net2Any<T>> {
        Self::create(ctx, Some(label)).await
    }

    async fn create(ctx: &Arc<NodeContext>, label: Option<&str>) -> ChannelResult<Net2Any<T>> {
        let (end, location) = create_input(ctx, label, None).await?;
        Ok(Net2Any {
            delivery: end.delivery.clone(),
            end: Arc::new(Mutex::new(end)),
            location,
        })
    }

    /// Waits for the next value. Concurrent readers take turns.
    pub async fn read(&self) -> ChannelResult<T> {
        self.end.lock().await
            .read().await
    }

    pub fn location(&self) -> &NetChannelLocation {
        &self.location
    }

    pub fn index(&self) -> ChannelIndex {
        self.delivery.index()
    }

    pub async fn destroy_reader(&self) {
        self.delivery.break_channel().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::NodeConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_labels_are_unique() {
        let ctx = NodeContext::new(NodeConfig::new("a")).unwrap();
        let input = Net2One::<String>::labelled(&ctx, "echo").await.unwrap();
        assert_eq!(input.label(), Some("echo"));
        assert_eq!(input.location().node, ctx.node_id());
        assert_eq!(input.location().index(), Some(input.index()));

        let duplicate = Net2One::<String>::labelled(&ctx, "echo").await;
        assert_eq!(duplicate.err().unwrap(), ChannelError::DuplicateLabel("echo".to_string()));
        assert_eq!(ctx.table().len().await, 1);
    }

    #[tokio::test]
    async fn test_read_after_destroy() {
        let ctx = NodeContext::new(NodeConfig::new("a")).unwrap();
        let mut input = Net2One::<String>::new(&ctx).await.unwrap();
        let index = input.index();

        input.destroy_reader().await;
        input.destroy_reader().await;

        assert_eq!(input.read().await, Err(ChannelError::Destroyed));
        assert!(ctx.table().lookup(index).await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_unblocks_reader() {
        let ctx = NodeContext::new(NodeConfig::new("a")).unwrap();
        let input = Net2Any::<String>::new(&ctx).await.unwrap();

        let reader = input.clone();
        let read = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        input.destroy_reader().await;
        assert_eq!(timeout(Duration::from_secs(1), read).await.unwrap().unwrap(), Err(ChannelError::Poisoned));
    }

    #[tokio::test]
    async fn test_dropping_last_clone_frees_index() {
        let ctx = NodeContext::new(NodeConfig::new("a")).unwrap();
        let input = Net2Any::<String>::labelled(&ctx, "shared").await.unwrap();
        let clone = input.clone();

        drop(input);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.table().lookup_label("shared").await.is_some());

        drop(clone);
        timeout(Duration::from_secs(1), async {
            while ctx.table().lookup_label("shared").await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }
}
