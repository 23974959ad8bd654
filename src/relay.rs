use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::config::{ProtectSettings, RelaySettings};

/// Sends one DNS payload upstream and returns the raw answer.
pub trait Relay {
    async fn forward(&self, payload: &[u8]) -> io::Result<Bytes>;
}

/// One query, one socket: every call opens a fresh UDP socket, performs a
/// single send and a single receive, then drops the socket.
#[derive(Debug, Clone)]
pub struct UdpRelay {
    upstream: SocketAddr,
    bind: SocketAddr,
    max_packet_size: usize,
    timeout: Option<Duration>,
    protect: ProtectSettings,
}

impl UdpRelay {
    pub fn new(upstream: SocketAddr, bind: SocketAddr, max_packet_size: usize) -> Self {
        Self {
            upstream,
            bind,
            max_packet_size,
            timeout: None,
            protect: ProtectSettings::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_protect(mut self, protect: ProtectSettings) -> Self {
        self.protect = protect;
        self
    }

    pub fn from_settings(settings: &RelaySettings) -> anyhow::Result<Self> {
        let upstream = settings.upstream_addr()?;
        let bind = settings.relay_bind_addr()?;
        if upstream.is_ipv4() != bind.is_ipv4() {
            anyhow::bail!(
                "relay_bind {} and upstream {} are different address families",
                bind,
                upstream
            );
        }
        Ok(Self::new(upstream, bind, settings.max_packet_size)
            .with_timeout(settings.upstream_timeout())
            .with_protect(settings.protect.clone()))
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    fn open_socket(&self) -> io::Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(self.upstream),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        protect_socket(&socket, &self.protect)?;
        socket.bind(&self.bind.into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }
}

impl Relay for UdpRelay {
    async fn forward(&self, payload: &[u8]) -> io::Result<Bytes> {
        let sock = self.open_socket()?;
        // connected: only datagrams from the upstream are delivered
        sock.connect(self.upstream).await?;
        sock.send(payload).await?;

        let mut buf = vec![0u8; self.max_packet_size];
        let len = match self.timeout {
            Some(dur) => timeout(dur, sock.recv(&mut buf)).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "upstream did not answer in time")
            })??,
            None => sock.recv(&mut buf).await?,
        };
        buf.truncate(len);
        debug!(upstream = %self.upstream, sent = payload.len(), received = len, "relayed dns exchange");
        Ok(Bytes::from(buf))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn protect_socket(socket: &Socket, protect: &ProtectSettings) -> io::Result<()> {
    if let Some(dev) = protect.bind_device.as_deref() {
        socket.bind_device(Some(dev.as_bytes()))?;
    }
    if let Some(mark) = protect.fwmark {
        socket.set_mark(mark)?;
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn protect_socket(_socket: &Socket, protect: &ProtectSettings) -> io::Result<()> {
    if protect.bind_device.is_some() || protect.fwmark.is_some() {
        tracing::warn!("relay socket protection is not supported on this platform, ignoring");
    }
    Ok(())
}
