use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::link::protocol::{LinkServer, NodeAddressId};
use crate::node::context::NodeContext;


/// Named settings for a service: plain strings, and lists of node addresses.
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    settings: BTreeMap<String, String>,
    addresses: BTreeMap<String, Vec<NodeAddressId>>,
}

impl ServiceSettings {
    /// names with a fixed meaning that can not be used for plain string settings
    pub const RESERVED_NAMES: [&'static str; 1] = [LinkServerService::ADDRESSES];

    pub fn add_setting(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        if Self::RESERVED_NAMES.contains(&name) {
            bail!("{:?} is a reserved setting name", name);
        }
        if self.addresses.contains_key(name) {
            bail!("{:?} is already used for an address setting", name);
        }
        self.settings.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn add_addresses(&mut self, name: &str, addresses: Vec<NodeAddressId>) -> anyhow::Result<()> {
        if self.settings.contains_key(name) {
            bail!("{:?} is already used for a string setting", name);
        }
        self.addresses.entry(name.to_string())
            .or_default()
            .extend(addresses);
        Ok(())
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(|s| s.as_str())
    }

    pub fn addresses(&self, name: &str) -> &[NodeAddressId] {
        self.addresses.get(name)
            .map(|a| a.as_slice())
            .unwrap_or_default()
    }
}


#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn init(&self, settings: &ServiceSettings) -> anyhow::Result<()>;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;
}


/// The services a node runs, by name
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<FxHashMap<String, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    /// initializes a service and registers it (without starting it)
    pub async fn install(&self, service: Arc<dyn Service>, settings: &ServiceSettings) -> anyhow::Result<()> {
        let name = service.name().to_string();
        if self.services.read().await.contains_key(&name) {
            bail!("a service named {:?} is already installed", name);
        }

        service.init(settings).await?;

        let mut services = self.services.write().await;
        if services.contains_key(&name) {
            bail!("a service named {:?} is already installed", name);
        }
        debug!("installed service {:?}", name);
        services.insert(name, service);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.read().await
            .get(name)
            .cloned()
    }

    pub async fn start(&self, name: &str) -> anyhow::Result<()> {
        self.get(name).await
            .ok_or_else(|| anyhow!("no service named {:?}", name))?
            .start().await
    }

    pub async fn stop(&self, name: &str) -> anyhow::Result<()> {
        self.get(name).await
            .ok_or_else(|| anyhow!("no service named {:?}", name))?
            .stop().await
    }

    pub async fn stop_all(&self) {
        let services: Vec<Arc<dyn Service>> = self.services.read().await
            .values()
            .cloned()
            .collect();

        for service in services {
            if service.is_running() {
                if let Err(e) = service.stop().await {
                    warn!("error stopping service {:?}: {}", service.name(), e);
                }
            }
        }
    }
}


struct LinkServerState {
    protocol: Option<String>,
    addresses: Vec<NodeAddressId>,
    servers: Vec<Box<dyn LinkServer>>,
}

/// Runs link servers for a node.
///
/// Settings: `protocol` (the id of a protocol registered with the node) and the address list
///  `addresses`.
pub struct LinkServerService {
    ctx: Weak<NodeContext>,
    state: Mutex<LinkServerState>,
    running: AtomicBool,
}

impl LinkServerService {
    pub const NAME: &'static str = "link-server";
    pub const PROTOCOL: &'static str = "protocol";
    pub const ADDRESSES: &'static str = "addresses";

    pub fn new(ctx: &Arc<NodeContext>) -> LinkServerService {
        LinkServerService {
            ctx: Arc::downgrade(ctx),
            state: Mutex::new(LinkServerState {
                protocol: None,
                addresses: Vec::new(),
                servers: Vec::new(),
            }),
            running: AtomicBool::new(false),
        }
    }

    /// the addresses the servers are actually bound to, e.g. with the port resolved
    pub async fn bound_addresses(&self) -> Vec<NodeAddressId> {
        self.state.lock().await
            .servers.iter()
            .map(|s| s.address().clone())
            .collect()
    }
}

#[async_trait]
impl Service for LinkServerService {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn init(&self, settings: &ServiceSettings) -> anyhow::Result<()> {
        let protocol = settings.setting(Self::PROTOCOL)
            .ok_or_else(|| anyhow!("link server service requires the setting {:?}", Self::PROTOCOL))?;
        let addresses = settings.addresses(Self::ADDRESSES);
        if addresses.is_empty() {
            bail!("link server service requires at least one address in {:?}", Self::ADDRESSES);
        }
        if let Some(a) = addresses.iter().find(|a| a.protocol() != protocol) {
            bail!("address {} does not belong to protocol {:?}", a, protocol);
        }

        let mut state = self.state.lock().await;
        state.protocol = Some(protocol.to_string());
        state.addresses = addresses.to_vec();
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let ctx = self.ctx.upgrade()
            .ok_or_else(|| anyhow!("node context was dropped"))?;

        let mut state = self.state.lock().await;
        if state.protocol.is_none() {
            bail!("link server service was not initialized");
        }
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        for address in state.addresses.clone() {
            let server = ctx.start_link_server(&address).await?;
            info!("link server started on {}", server.address());
            state.servers.push(server);
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        for server in state.servers.drain(..) {
            server.stop().await;
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
