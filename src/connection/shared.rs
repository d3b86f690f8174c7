use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::channels::error::{ChannelError, ChannelResult};
use crate::connection::client::NetConnectionClient;
use crate::connection::server::NetConnectionServer;
use crate::messages::serialized::NetSerializable;
use crate::node::context::NodeContext;
use crate::node::location::NetConnectionLocation;


/// Counts the live duplicates of a shared end. The duplicate that brings it to zero releases
///  the underlying resources.
struct Duplicates(AtomicUsize);

impl Duplicates {
    fn new() -> Arc<Duplicates> {
        Arc::new(Duplicates(AtomicUsize::new(1)))
    }

    fn add(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// true for the last duplicate
    fn release(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}


/// A connection client that can be duplicated for use by several tasks.
///
/// All duplicates share one underlying client. A duplicate has exclusive use of it from the
///  request that opens a session until the reply that closes it, so sessions of different
///  duplicates never interleave.
pub struct SharedNetConnectionClient<Req, Rep> {
    client: Arc<Mutex<NetConnectionClient<Req, Rep>>>,
    duplicates: Arc<Duplicates>,
    session: Option<OwnedMutexGuard<NetConnectionClient<Req, Rep>>>,
    destroyed: bool,
}

impl<Req: NetSerializable, Rep: NetSerializable> SharedNetConnectionClient<Req, Rep> {
    pub async fn new(ctx: &Arc<NodeContext>, server: &NetConnectionLocation) -> ChannelResult<SharedNetConnectionClient<Req, Rep>> {
        Ok(NetConnectionClient::new(ctx, server).await?.into())
    }

    pub fn duplicate(&self) -> ChannelResult<SharedNetConnectionClient<Req, Rep>> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }
        self.duplicates.add();
        Ok(SharedNetConnectionClient {
            client: self.client.clone(),
            duplicates: self.duplicates.clone(),
            session: None,
            destroyed: false,
        })
    }

    /// the number of duplicates that were not destroyed yet
    pub fn duplicate_count(&self) -> usize {
        self.duplicates.count()
    }

    pub async fn request(&mut self, value: &Req) -> ChannelResult<()> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }
        if self.session.is_none() {
            self.session = Some(self.client.clone().lock_owned().await);
        }
        let Some(client) = self.session.as_mut() else {
            return Err(ChannelError::Destroyed);
        };

        let result = client.request(value).await;
        if result.is_err() && !client.is_open() {
            self.session = None;
        }
        result
    }

    pub async fn reply(&mut self) -> ChannelResult<Rep> {
        let Some(client) = self.session.as_mut() else {
            return Err(ChannelError::Destroyed);
        };

        let result = client.reply().await;
        if !client.is_open() {
            // the server closed the session, other duplicates may go ahead
            self.session = None;
        }
        result
    }

    /// Detaches this duplicate. The last duplicate to do so releases the client's channels.
    pub async fn destroy_client(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.session = None;

        if self.duplicates.release() {
            debug!("last duplicate of a shared connection client - releasing it");
            self.client.lock().await
                .destroy_client().await;
        }
    }
}

impl<Req, Rep> From<NetConnectionClient<Req, Rep>> for SharedNetConnectionClient<Req, Rep> {
    fn from(value: NetConnectionClient<Req, Rep>) -> Self {
        SharedNetConnectionClient {
            client: Arc::new(Mutex::new(value)),
            duplicates: Duplicates::new(),
            session: None,
            destroyed: false,
        }
    }
}

impl<Req, Rep> Drop for SharedNetConnectionClient<Req, Rep> {
    fn drop(&mut self) {
        // the client's channels release themselves when the last reference is gone
        if !self.destroyed {
            self.duplicates.release();
        }
    }
}


/// A connection server that can be duplicated for use by several tasks. A duplicate has
///  exclusive use of the server from the request that opens a session until it closes the
///  session.
pub struct SharedNetConnectionServer<Req, Rep> {
    server: Arc<Mutex<NetConnectionServer<Req, Rep>>>,
    duplicates: Arc<Duplicates>,
    session: Option<OwnedMutexGuard<NetConnectionServer<Req, Rep>>>,
    location: NetConnectionLocation,
    destroyed: bool,
}

impl<Req: NetSerializable, Rep: NetSerializable> SharedNetConnectionServer<Req, Rep> {
    pub async fn new(ctx: &Arc<NodeContext>) -> ChannelResult<SharedNetConnectionServer<Req, Rep>> {
        Ok(NetConnectionServer::new(ctx).await?.into())
    }

    pub async fn labelled(ctx: &Arc<NodeContext>, label: &str) -> ChannelResult<SharedNetConnectionServer<Req, Rep>> {
        Ok(NetConnectionServer::labelled(ctx, label).await?.into())
    }

    pub fn duplicate(&self) -> ChannelResult<SharedNetConnectionServer<Req, Rep>> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }
        self.duplicates.add();
        Ok(SharedNetConnectionServer {
            server: self.server.clone(),
            duplicates: self.duplicates.clone(),
            session: None,
            location: self.location.clone(),
            destroyed: false,
        })
    }

    pub fn duplicate_count(&self) -> usize {
        self.duplicates.count()
    }

    pub fn location(&self) -> &NetConnectionLocation {
        &self.location
    }

    pub async fn request(&mut self) -> ChannelResult<Req> {
        if self.destroyed {
            return Err(ChannelError::Destroyed);
        }
        if self.session.is_none() {
            self.session = Some(self.server.clone().lock_owned().await);
        }
        let Some(server) = self.session.as_mut() else {
            return Err(ChannelError::Destroyed);
        };

        let result = server.request().await;
        if !server.is_session_open() {
            self.session = None;
        }
        result
    }

    pub async fn reply(&mut self, value: &Rep) -> ChannelResult<()> {
        match self.session.as_mut() {
            Some(server) => server.reply(value).await,
            None => Err(ChannelError::Destroyed),
        }
    }

    pub async fn reply_and_close(&mut self, value: &Rep) -> ChannelResult<()> {
        let Some(mut server) = self.session.take() else {
            return Err(ChannelError::Destroyed);
        };
        server.reply_and_close(value).await
    }

    /// Detaches this duplicate. The last duplicate to do so releases the server's channels.
    pub async fn destroy_server(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.session = None;

        if self.duplicates.release() {
            debug!("last duplicate of a shared connection server - releasing it");
            self.server.lock().await
                .destroy_server().await;
        }
    }
}

impl<Req: NetSerializable, Rep: NetSerializable> From<NetConnectionServer<Req, Rep>> for SharedNetConnectionServer<Req, Rep> {
    fn from(value: NetConnectionServer<Req, Rep>) -> Self {
        let location = value.location().clone();
        SharedNetConnectionServer {
            server: Arc::new(Mutex::new(value)),
            duplicates: Duplicates::new(),
            session: None,
            location,
            destroyed: false,
        }
    }
}

impl<Req, Rep> Drop for SharedNetConnectionServer<Req, Rep> {
    fn drop(&mut self) {
        if !self.destroyed {
            self.duplicates.release();
        }
    }
}
