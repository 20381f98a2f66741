use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, warn};

use crate::messaging::node_addr::NodeAddr;
use crate::router::stub::{ConnectionStatus, PhysicalAddressResolver, RouterStub};
use crate::util::scheduler::{ScheduledTask, TimeScheduler};

/// Lifecycle manager for a dynamic set of gossip router connections.
///
/// Every registered stub has at most one periodic background task at a time: a *reconnector*
///  while the connection is down (resolve the member's physical address, attempt
///  `stub.connect`, retry every `interval`), or a *pinger* once it is up (`check_connection`
///  every `interval`, starting after a second). State changes reported through
///  [RouterStubManager::connection_status_change] switch between the two.
///
/// The stub list is read-mostly and kept behind a read/write lock; the task registry is a
///  concurrent map keyed by router address. Task replacement deliberately runs as
///  `cancel(old); insert-if-vacant(new)` - losing that race leaves the previously scheduled
///  task in place, which callers accept.
pub struct RouterStubManager<S: RouterStub> {
    stubs: RwLock<Vec<Arc<S>>>,
    tasks: DashMap<SocketAddr, ScheduledTask>,

    resolver: Arc<dyn PhysicalAddressResolver>,
    scheduler: Arc<TimeScheduler>,
    group_name: String,
    logical_addr: NodeAddr,
    logical_name: String,
    interval: Duration,
}

impl<S: RouterStub> RouterStubManager<S> {
    pub fn new(
        resolver: Arc<dyn PhysicalAddressResolver>,
        scheduler: Arc<TimeScheduler>,
        group_name: String,
        logical_addr: NodeAddr,
        logical_name: String,
        interval: Duration,
    ) -> RouterStubManager<S> {
        RouterStubManager {
            stubs: RwLock::new(Vec::new()),
            tasks: DashMap::default(),
            resolver,
            scheduler,
            group_name,
            logical_addr,
            logical_name,
            interval,
        }
    }

    pub async fn stubs(&self) -> Vec<Arc<S>> {
        self.stubs.read().await.clone()
    }

    /// Builds a stub for the given router and registers it, destroying and replacing any
    ///  previously registered stub for the same router.
    pub async fn create_and_register(&self, router_host: &str, router_port: u16, bind_addr: Option<IpAddr>) -> Arc<S> {
        let stub = S::new(router_host, router_port, bind_addr);
        debug!("creating stub for router {}", stub.gossip_router_addr());
        self.unregister_and_destroy(&stub).await;
        self.stubs.write().await.push(stub.clone());
        stub
    }

    pub async fn register(&self, stub: Arc<S>) {
        debug!("registering stub for router {}", stub.gossip_router_addr());
        self.unregister_and_destroy(&stub).await;
        self.stubs.write().await.push(stub);
    }

    /// removes the registered stub for the same router, returning it without destroying it
    pub async fn unregister(&self, stub: &Arc<S>) -> Option<Arc<S>> {
        let mut stubs = self.stubs.write().await;
        let position = stubs.iter()
            .position(|s| s.gossip_router_addr() == stub.gossip_router_addr())?;
        Some(stubs.remove(position))
    }

    pub async fn unregister_and_destroy(&self, stub: &Arc<S>) -> bool {
        match self.unregister(stub).await {
            Some(unregistered) => {
                unregistered.destroy();
                true
            }
            None => false,
        }
    }

    /// best-effort disconnect of every registered stub; failures are logged and swallowed
    pub async fn disconnect_all(&self) {
        for stub in self.stubs.read().await.iter() {
            debug!("disconnecting stub {}", stub.gossip_router_addr());
            if let Err(e) = stub.disconnect(&self.group_name, self.logical_addr).await {
                debug!("failed disconnecting stub {}: {}", stub.gossip_router_addr(), e);
            }
        }
    }

    /// stops all per-stub tasks, destroys all stubs and clears the registry
    pub async fn destroy_all(&self) {
        let mut stubs = self.stubs.write().await;
        for stub in stubs.iter() {
            if let Some((_, task)) = self.tasks.remove(&stub.gossip_router_addr()) {
                task.cancel();
            }
            stub.destroy();
        }
        stubs.clear();
    }

    /// Replaces the stub's background task with a reconnector: every `interval` (starting
    ///  immediately), resolve the member's physical address and attempt to connect, retrying
    ///  until the stub reports [ConnectionStatus::Connected].
    pub fn start_reconnecting(&self, stub: &Arc<S>) {
        let key = stub.gossip_router_addr();
        if let Some((_, task)) = self.tasks.remove(&key) {
            task.cancel();
        }

        let stub = stub.clone();
        let resolver = self.resolver.clone();
        let group_name = self.group_name.clone();
        let logical_addr = self.logical_addr;
        let logical_name = self.logical_name.clone();

        let task = self.scheduler.schedule_with_fixed_delay(Duration::ZERO, self.interval, move || {
            let stub = stub.clone();
            let resolver = resolver.clone();
            let group_name = group_name.clone();
            let logical_name = logical_name.clone();

            async move {
                debug!("reconnecting stub {}", stub.gossip_router_addr());
                let physical_addrs = match resolver.physical_address(logical_addr).await {
                    Some(addr) => vec![addr],
                    None => Vec::new(),
                };
                match stub.connect(&group_name, logical_addr, &logical_name, &physical_addrs).await {
                    Ok(()) => debug!("reconnected stub {}", stub.gossip_router_addr()),
                    Err(e) => warn!("failed reconnecting stub to router at {}: {}", stub.gossip_router_addr(), e),
                }
            }
        });
        self.tasks.entry(key).or_insert(task);
    }

    /// Replaces the stub's background task with a pinger: every `interval` (starting after a
    ///  second), probe the established connection.
    pub fn stop_reconnecting(&self, stub: &Arc<S>) {
        let key = stub.gossip_router_addr();
        if let Some((_, task)) = self.tasks.remove(&key) {
            task.cancel();
        }

        let stub = stub.clone();
        let task = self.scheduler.schedule_with_fixed_delay(Duration::from_secs(1), self.interval, move || {
            let stub = stub.clone();

            async move {
                debug!("pinging router {}", stub.gossip_router_addr());
                match stub.check_connection().await {
                    Ok(()) => debug!("pinged router {}", stub.gossip_router_addr()),
                    Err(e) => warn!("failed pinging router at {}: {}", stub.gossip_router_addr(), e),
                }
            }
        });
        self.tasks.entry(key).or_insert(task);
    }

    pub async fn connection_status_change(&self, stub: &Arc<S>, new_state: ConnectionStatus) {
        match new_state {
            ConnectionStatus::ConnectionBroken => {
                debug!("connection broke with stub {}", stub.gossip_router_addr());
                stub.interrupt();
                stub.destroy();
                self.start_reconnecting(stub);
            }
            ConnectionStatus::Connected => {
                debug!("connection established with stub {}", stub.gossip_router_addr());
                self.stop_reconnecting(stub);
            }
            ConnectionStatus::Disconnected => {
                // bounded wait for the stub's worker to acknowledge the disconnect
                if time::timeout(self.interval, stub.join()).await.is_err() {
                    debug!("stub {} did not acknowledge the disconnect within {:?}",
                        stub.gossip_router_addr(), self.interval);
                }
            }
        }
    }

    pub async fn print_stubs(&self) -> String {
        self.stubs.read().await.iter()
            .map(|stub| stub.gossip_router_addr().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
