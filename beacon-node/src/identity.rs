// Node identity
//
// INTENTION: Compute the addressing identity of a process exactly once at
// start-up and pass it explicitly to every component that needs it. Nothing
// in the crate reads host, port or random identifiers from ambient state.

use anyhow::{anyhow, Result};
use beacon_common::ids;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

use crate::config::BeaconConfig;
use crate::errors::RpcError;

/// How many consecutive ports are probed before giving up
pub const PORT_SCAN_LIMIT: u16 = 1000;

/// Addressing identity of one client or server process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Host advertised to other processes
    pub host: String,
    /// Listening port (servers) or the configured/default port (clients)
    pub port: u16,
    /// `host:port`, the key a server publishes its presence under
    pub provider_id: String,
    /// `host.pid.random`, stamped on every outgoing call
    pub sender_id: String,
}

impl NodeIdentity {
    /// Build an identity from explicit values
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            provider_id: ids::provider_id(&host, port),
            sender_id: ids::sender_id(&host),
            host,
            port,
        }
    }

    /// Identity for a server: resolves the host and picks a free port
    pub fn resolve(config: &BeaconConfig) -> Result<Self, RpcError> {
        let host = match &config.host {
            Some(host) => host.clone(),
            None => detect_local_ipv4().unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string()),
        };
        let port = match config.port {
            Some(0) => {
                return Err(RpcError::InvalidParams(
                    "port 0 cannot be advertised; configure a concrete port".into(),
                ))
            }
            Some(port) => port,
            None => first_free_port(config.default_port).ok_or_else(|| {
                RpcError::InvalidParams(format!(
                    "no free port found in {}..{}",
                    config.default_port,
                    config.default_port.saturating_add(PORT_SCAN_LIMIT)
                ))
            })?,
        };
        Ok(Self::new(host, port))
    }

    /// Identity for a client: never probes ports, it does not listen
    pub fn for_client(config: &BeaconConfig) -> Self {
        let host = match &config.host {
            Some(host) => host.clone(),
            None => detect_local_ipv4().unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string()),
        };
        Self::new(host, config.port.unwrap_or(config.default_port))
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (sender {})", self.provider_id, self.sender_id)
    }
}

/// Get a non-loopback IPv4 address of this machine.
///
/// "Connecting" a UDP socket sends nothing but makes the OS pick the
/// interface it would route through.
pub fn detect_local_ipv4() -> Result<String> {
    use socket2::{Domain, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    let addr: SocketAddr = "8.8.8.8:80".parse()?;
    socket.connect(&addr.into())?;

    let local_addr = socket.local_addr()?;
    match local_addr.as_socket_ipv4() {
        Some(addr) if !addr.ip().is_unspecified() => Ok(addr.ip().to_string()),
        _ => Err(anyhow!("Failed to get IPv4 address")),
    }
}

/// First port at or above `start` that can be bound on all interfaces
pub fn first_free_port(start: u16) -> Option<u16> {
    let end = start.saturating_add(PORT_SCAN_LIMIT);
    (start..end).find(|port| {
        TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), *port)).is_ok()
    })
}
