
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use util::Conn;

use crate::control::{IceMode, Role};
use crate::error::*;
use crate::port::{Port, PortConfig, PortEvent, PortKind};

/// Everything a port allocator needs to know to produce the ports of one
/// component.
#[derive(Clone)]
pub struct AllocationConfig {
    pub component: u16,
    pub ufrag: String,
    pub pwd: String,
    pub mode: IceMode,
    pub role: Role,
    pub tiebreaker: u64,
    pub generation: u32,
    /// Grace period override for empty-port teardown; 0 means the default.
    pub timeout_delay: u64,
}

/// The seam to candidate gathering: host gathering ships with the engine,
/// while srflx/relay discovery (STUN/TURN server round-trips, failover) is
/// the responsibility of richer implementations.
#[async_trait]
pub trait PortAllocator {
    async fn allocate_ports(
        &self,
        config: &AllocationConfig,
        events: mpsc::UnboundedSender<PortEvent>,
    ) -> Result<Vec<Arc<Port>>>;
}

/// Allocates a single UDP host port on the configured interface.
pub struct UdpHostAllocator {
    pub listen_ip: IpAddr,
}

impl UdpHostAllocator {
    pub fn new(listen_ip: IpAddr) -> Self {
        UdpHostAllocator { listen_ip }
    }
}

#[async_trait]
impl PortAllocator for UdpHostAllocator {
    async fn allocate_ports(
        &self,
        config: &AllocationConfig,
        events: mpsc::UnboundedSender<PortEvent>,
    ) -> Result<Vec<Arc<Port>>> {
        let socket = UdpSocket::bind((self.listen_ip, 0)).await?;
        let conn: Arc<dyn Conn + Send + Sync> = Arc::new(socket);

        let port = Port::new(PortConfig {
            kind: PortKind::Host,
            component: config.component,
            mode: config.mode,
            conn,
            ufrag: config.ufrag.clone(),
            pwd: config.pwd.clone(),
            role: config.role,
            tiebreaker: config.tiebreaker,
            generation: config.generation,
            network_name: String::new(),
            timeout_delay: config.timeout_delay,
            events,
        });

        Ok(vec![port])
    }
}
