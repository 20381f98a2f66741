use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::node_addr::NodeAddr;

/// Connection state of a router stub, as observed by whoever drives its wire protocol and
///  reported to the [crate::router::stub_manager::RouterStubManager].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    ConnectionBroken,
    Disconnected,
}

/// Handle to a connection with an external gossip router, used for bootstrap and presence in
///  networks without IP multicast.
///
/// The wire protocol lives below this crate; the manager only drives the lifecycle: connecting
///  with the member's logical and physical addresses, periodic health checks, and teardown.
///  Implementations must be safe to call from shared scheduler tasks.
#[async_trait]
pub trait RouterStub: Send + Sync + 'static {
    fn new(router_host: &str, router_port: u16, bind_addr: Option<IpAddr>) -> Arc<Self>;

    /// the router's address; doubles as the stub's registry identity
    fn gossip_router_addr(&self) -> SocketAddr;

    async fn connect(&self, group: &str, logical_addr: NodeAddr, logical_name: &str, physical_addrs: &[SocketAddr]) -> anyhow::Result<()>;

    async fn disconnect(&self, group: &str, logical_addr: NodeAddr) -> anyhow::Result<()>;

    /// liveness probe on an established connection
    async fn check_connection(&self) -> anyhow::Result<()>;

    /// aborts whatever the stub's worker is doing
    fn interrupt(&self);

    /// releases the stub's resources; terminal
    fn destroy(&self);

    /// Completes when the stub's worker has acknowledged a disconnect. Callers bound the wait
    ///  with a timeout.
    async fn join(&self);
}

/// Upward query into the protocol stack: resolve a member's logical address to the physical
///  address a router should forward to.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PhysicalAddressResolver: Send + Sync + 'static {
    async fn physical_address(&self, logical_addr: NodeAddr) -> Option<SocketAddr>;
}
