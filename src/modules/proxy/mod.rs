//! Ephemeral proxy relay for remote solving services.
//!
//! A [`ProxyRelay`] binds a SOCKS5 (and HTTP `CONNECT`) listener on a random
//! high port, maps that port through the NAT for each permitted peer, and
//! runs the accept loop on its own task until [`ProxyRelay::stop`] is called.

pub mod socks5;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::modules::nat::{NatError, NatLease, NatTraversal};

const BIND_ATTEMPTS: usize = 20;

/// Errors surfaced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("nat traversal failed: {0}")]
    Nat(#[from] NatError),
    #[error("no free port found in {0:?}")]
    NoFreePort(RangeInclusive<u16>),
    #[error("proxy protocol error: {0}")]
    Protocol(String),
    #[error("unsupported SOCKS address type {0:#04x}")]
    UnsupportedAddress(u8),
}

/// Which remote hosts may use the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPolicy {
    Any,
    Only(Vec<IpAddr>),
}

impl PeerPolicy {
    pub fn only<I: IntoIterator<Item = IpAddr>>(peers: I) -> Self {
        PeerPolicy::Only(peers.into_iter().collect())
    }

    pub fn allows(&self, peer: IpAddr) -> bool {
        match self {
            PeerPolicy::Any => true,
            PeerPolicy::Only(peers) => peers.contains(&peer),
        }
    }

    /// Remote hosts a NAT mapping is opened for; `None` is the wildcard.
    fn mapping_hosts(&self) -> Vec<Option<IpAddr>> {
        match self {
            PeerPolicy::Any => vec![None],
            PeerPolicy::Only(peers) => peers.iter().copied().map(Some).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port_range: RangeInclusive<u16>,
    pub bind_ip: IpAddr,
    pub lease: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port_range: 5000..=60000,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            lease: crate::modules::nat::DEFAULT_LEASE,
        }
    }
}

/// Running SOCKS relay plus the NAT leases that expose it.
pub struct ProxyRelay {
    nat: Arc<NatTraversal>,
    peers: PeerPolicy,
    local_addr: SocketAddr,
    leases: Vec<NatLease>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProxyRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRelay")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers)
            .field("leases", &self.leases.len())
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl ProxyRelay {
    /// Start a relay with the default port range and lease.
    pub async fn start(nat: Arc<NatTraversal>, peers: PeerPolicy) -> Result<Self, RelayError> {
        Self::start_with(nat, peers, RelayConfig::default()).await
    }

    /// Start a relay on a random free port from `config.port_range`.
    ///
    /// The listener is bound first because the chosen port is what gets
    /// mapped. Nothing is accepted until every mapping is open; if one
    /// fails, the mappings already opened are removed and the listener is
    /// dropped with the error.
    pub async fn start_with(nat: Arc<NatTraversal>, peers: PeerPolicy, config: RelayConfig) -> Result<Self, RelayError> {
        let listener = bind_random(&config).await?;
        let local_addr = listener.local_addr()?;
        let port = local_addr.port();

        let mut leases = Vec::new();
        for remote in peers.mapping_hosts() {
            log::info!(
                "opening NAT port {port} for remote {}",
                remote.map(|ip| ip.to_string()).unwrap_or_else(|| "*".into())
            );
            match nat.open_port(remote, port, port, Some(config.lease)).await {
                Ok(lease) => leases.push(lease),
                Err(err) => {
                    close_leases(&nat, &leases).await;
                    return Err(err.into());
                }
            }
        }

        log::info!("launching socks5 relay on local port {port}");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, peers.clone(), shutdown_rx));

        Ok(Self {
            nat,
            peers,
            local_addr,
            leases,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &PeerPolicy {
        &self.peers
    }

    pub fn leases(&self) -> &[NatLease] {
        &self.leases
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// `wan_ip:port` remote peers should use to reach the relay.
    pub async fn wan_address(&self) -> Result<SocketAddr, RelayError> {
        let ip = self.nat.external_ip().await?;
        let port = self.leases.first().map(|lease| lease.external_port).unwrap_or(self.port());
        Ok(SocketAddr::new(ip, port))
    }

    /// Stop accepting, abort relayed sessions and remove every NAT mapping.
    /// Safe to call more than once.
    pub async fn stop(&mut self) -> Result<(), RelayError> {
        if let Some(shutdown) = self.shutdown.take() {
            log::info!("stopping socks5 relay on port {}", self.port());
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
            && !err.is_cancelled()
        {
            log::warn!("relay task ended abnormally: {err}");
        }

        let leases = std::mem::take(&mut self.leases);
        let mut first_error = None;
        for lease in &leases {
            if let Err(err) = self.nat.close_lease(lease).await {
                log::warn!("failed to close NAT port {}: {err}", lease.external_port);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Drop for ProxyRelay {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.leases.is_empty() {
            return;
        }
        let leases = std::mem::take(&mut self.leases);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let nat = self.nat.clone();
                handle.spawn(async move { close_leases(&nat, &leases).await });
            }
            Err(_) => log::warn!("relay dropped outside a runtime; {} NAT leases left to expire", leases.len()),
        }
    }
}

async fn close_leases(nat: &NatTraversal, leases: &[NatLease]) {
    for lease in leases {
        if let Err(err) = nat.close_lease(lease).await {
            log::warn!("failed to close NAT port {}: {err}", lease.external_port);
        }
    }
}

async fn bind_random(config: &RelayConfig) -> Result<TcpListener, RelayError> {
    for _ in 0..BIND_ATTEMPTS {
        let port = rand::thread_rng().gen_range(config.port_range.clone());
        match TcpListener::bind(SocketAddr::new(config.bind_ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(RelayError::NoFreePort(config.port_range.clone()))
}

async fn accept_loop(listener: TcpListener, peers: PeerPolicy, mut shutdown: oneshot::Receiver<()>) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !peers.allows(peer.ip()) {
                        log::warn!("rejecting relay connection from {peer}");
                        continue;
                    }
                    log::debug!("relay connection from {peer}");
                    sessions.spawn(async move {
                        if let Err(err) = socks5::serve(stream).await {
                            log::debug!("relay session from {peer} failed: {err}");
                        }
                    });
                }
                Err(err) => log::warn!("relay accept failed: {err}"),
            },
        }
    }
    sessions.abort_all();
    log::debug!("relay accept loop exited with {} sessions aborted", sessions.len());
}
