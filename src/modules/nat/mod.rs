//! NAT traversal for the captcha relay.
//!
//! Works out whether this host is directly reachable, and if it sits behind
//! a NAT, finds a UPnP internet gateway and opens/closes TCP port mappings on
//! it so that a third-party solving service can connect back to a local
//! listener.

pub mod netblocks;
pub mod soap;
pub mod ssdp;
mod xml;

pub use netblocks::{PRIVATE_NETBLOCKS, is_private_ip};
pub use soap::IgdGateway;
pub use ssdp::WanService;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Default lease requested for a port mapping.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 15);
pub const MAPPING_DESCRIPTION: &str = "WebRequest CaptchaSolver Hole Punching.";

const ROUTE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 53);
const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by NAT discovery and port mapping.
#[derive(Debug, Error)]
pub enum NatError {
    #[error("could not determine the local IP; is this host connected?")]
    CouldNotDetermineLocalIp,
    #[error("gateway did not report a WAN IP address")]
    CouldNotDetermineWanIp,
    #[error("no UPnP gateway found ({devices} UPnP devices on LAN)")]
    CouldNotFindUpnpGateway { devices: usize },
    #[error("UPnP {action} failed ({code:?}): {message}")]
    Soap {
        action: &'static str,
        code: Option<u16>,
        message: String,
    },
    #[error("could not build gateway request: {0}")]
    Xml(String),
    #[error("gateway http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("network i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Arguments of an `AddPortMapping` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// `None` accepts any remote host.
    pub remote_host: Option<IpAddr>,
    pub external_port: u16,
    pub internal_port: u16,
    pub internal_client: IpAddr,
    pub protocol: Protocol,
    pub lease: Duration,
    pub description: String,
}

/// A live mapping handed out by [`NatTraversal::open_port`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatLease {
    pub external_ip: IpAddr,
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
    pub lease: Duration,
    pub remote_host: Option<IpAddr>,
}

/// Device able to create and remove port mappings.
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn external_ip(&self) -> Result<IpAddr, NatError>;
    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), NatError>;
    async fn delete_port_mapping(
        &self,
        remote_host: Option<IpAddr>,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), NatError>;
}

/// Local reachability facts plus the gateway used to punch through.
#[derive(Clone)]
pub struct NatTraversal {
    local_ip: IpAddr,
    is_public: bool,
    gateway: Option<Arc<dyn PortMapper>>,
}

impl std::fmt::Debug for NatTraversal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTraversal")
            .field("local_ip", &self.local_ip)
            .field("is_public", &self.is_public)
            .field("has_gateway", &self.gateway.is_some())
            .finish()
    }
}

impl NatTraversal {
    /// Determine the local address and, when it is private, locate a UPnP
    /// gateway exposing `WANIPConnection`.
    pub async fn discover() -> Result<Self, NatError> {
        let local_ip = local_ip().await?;
        if !is_private_ip(local_ip) {
            log::info!("{local_ip} is a public address, no port forwarding needed");
            return Ok(Self::public(local_ip));
        }

        log::info!("local IP {local_ip} is private, looking for a UPnP gateway");
        let client = reqwest::Client::builder()
            .connect_timeout(GATEWAY_TIMEOUT)
            .timeout(GATEWAY_TIMEOUT)
            .build()?;

        let locations = ssdp::discover_locations(DISCOVERY_WINDOW).await?;
        let devices = locations.len();
        for location in locations {
            let description = match client.get(location.clone()).send().await {
                Ok(response) => match response.text().await {
                    Ok(text) => text,
                    Err(err) => {
                        log::debug!("failed reading description {location}: {err}");
                        continue;
                    }
                },
                Err(err) => {
                    log::debug!("failed fetching description {location}: {err}");
                    continue;
                }
            };

            if let Some(service) = ssdp::find_wan_ip_service(&description, &location) {
                log::info!("found gateway device at {location}");
                let traversal = Self::with_gateway(local_ip, Arc::new(IgdGateway::new(client, service)));
                match traversal.external_ip().await {
                    Ok(wan) => log::info!("resolved WAN address: {wan}"),
                    Err(err) => log::warn!("gateway found but WAN address unavailable: {err}"),
                }
                return Ok(traversal);
            }
        }

        Err(NatError::CouldNotFindUpnpGateway { devices })
    }

    /// Host with a routable address; mappings are no-ops.
    pub fn public(local_ip: IpAddr) -> Self {
        Self {
            local_ip,
            is_public: !is_private_ip(local_ip),
            gateway: None,
        }
    }

    /// Host behind `gateway`.
    pub fn with_gateway(local_ip: IpAddr, gateway: Arc<dyn PortMapper>) -> Self {
        Self {
            local_ip,
            is_public: !is_private_ip(local_ip),
            gateway: Some(gateway),
        }
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    /// Whether listeners need a port mapping to be reachable.
    pub fn needs_mapping(&self) -> bool {
        !self.is_public
    }

    fn gateway(&self) -> Result<&Arc<dyn PortMapper>, NatError> {
        self.gateway
            .as_ref()
            .ok_or(NatError::CouldNotFindUpnpGateway { devices: 0 })
    }

    /// Address remote peers should connect to.
    pub async fn external_ip(&self) -> Result<IpAddr, NatError> {
        if self.is_public {
            return Ok(self.local_ip);
        }
        self.gateway()?.external_ip().await
    }

    /// Forward `external_port` on the gateway to `internal_port` on this
    /// host. Re-opening an existing mapping refreshes it.
    pub async fn open_port(
        &self,
        remote_host: Option<IpAddr>,
        external_port: u16,
        internal_port: u16,
        lease: Option<Duration>,
    ) -> Result<NatLease, NatError> {
        let lease = lease.unwrap_or(DEFAULT_LEASE);
        let external_ip = self.external_ip().await?;

        if self.is_public {
            return Ok(NatLease {
                external_ip,
                external_port: internal_port,
                internal_port,
                protocol: Protocol::Tcp,
                lease,
                remote_host,
            });
        }

        let mapping = PortMapping {
            remote_host,
            external_port,
            internal_port,
            internal_client: self.local_ip,
            protocol: Protocol::Tcp,
            lease,
            description: MAPPING_DESCRIPTION.to_string(),
        };
        self.gateway()?.add_port_mapping(&mapping).await?;
        log::info!(
            "forwarding from remote {}:{external_port} to local {}:{internal_port}, lease expires in {}s",
            remote_host.map(|ip| ip.to_string()).unwrap_or_else(|| "*".into()),
            self.local_ip,
            lease.as_secs()
        );

        Ok(NatLease {
            external_ip,
            external_port,
            internal_port,
            protocol: Protocol::Tcp,
            lease,
            remote_host,
        })
    }

    /// Remove a mapping. Closing a mapping that is already gone succeeds.
    pub async fn close_port(&self, remote_host: Option<IpAddr>, external_port: u16) -> Result<(), NatError> {
        if self.is_public {
            return Ok(());
        }
        log::info!(
            "closing forwarded port from remote {}:{external_port}",
            remote_host.map(|ip| ip.to_string()).unwrap_or_else(|| "*".into())
        );
        self.gateway()?
            .delete_port_mapping(remote_host, external_port, Protocol::Tcp)
            .await
    }

    pub async fn close_lease(&self, lease: &NatLease) -> Result<(), NatError> {
        self.close_port(lease.remote_host, lease.external_port).await
    }
}

/// First non-loopback IPv4 address of this host, falling back to the source
/// address the OS would use to reach a public resolver.
pub async fn local_ip() -> Result<IpAddr, NatError> {
    if let Some(name) = hostname()
        && let Ok(addrs) = tokio::net::lookup_host((name.as_str(), 0)).await
    {
        let found = addrs
            .map(|addr| addr.ip())
            .find(|ip| ip.is_ipv4() && !ip.is_loopback());
        if let Some(ip) = found {
            return Ok(ip);
        }
    }

    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.connect(SocketAddr::from(ROUTE_TARGET)).await?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(NatError::CouldNotDetermineLocalIp);
    }
    Ok(ip)
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and gethostname
    // writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    (!name.is_empty()).then_some(name)
}
