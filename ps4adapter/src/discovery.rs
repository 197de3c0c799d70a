/// Console discovery
///
/// The stub answers a UDP broadcast of its magic value on port 1010 with the
/// same four bytes; the source address of that reply is the console.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;

pub const BROADCAST_PORT: u16 = 1010;
pub const BROADCAST_MAGIC: u32 = 0xFFFF_AAAA;

/// Default time to wait for a console to answer.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(4);

const SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("could not determine a local IPv4 address")]
    NoLocalAddress,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no console answered within {0:?}")]
    Timeout(Duration),
    #[error("reply from {from} carries magic 0x{magic:08X}")]
    WrongMagic { from: SocketAddr, magic: u32 },
    #[error("reply from {0} is too short")]
    ShortReply(SocketAddr),
}

pub fn broadcast_address(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(mask))
}

/// Address of the interface the OS would route outbound traffic through.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub async fn local_ipv4() -> Result<Ipv4Addr, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket
        .connect((Ipv4Addr::new(10, 254, 254, 254), 1))
        .await
        .map_err(|_| DiscoveryError::NoLocalAddress)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => Ok(ip),
        _ => Err(DiscoveryError::NoLocalAddress),
    }
}

/// Broadcast on the local /24 and return the first console that answers.
pub async fn find_playstation(timeout: Duration) -> crate::Result<IpAddr> {
    let local = local_ipv4().await?;
    find_playstation_from(local, timeout).await
}

pub async fn find_playstation_from(local: Ipv4Addr, timeout: Duration) -> crate::Result<IpAddr> {
    let target = SocketAddr::new(
        IpAddr::V4(broadcast_address(local, SUBNET_MASK)),
        BROADCAST_PORT,
    );
    Ok(probe(target, timeout).await?)
}

/// Send the discovery magic to `target` and wait for the answer.
pub async fn probe(target: SocketAddr, timeout: Duration) -> Result<IpAddr, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    log::debug!("Discovery probe to {}", target);
    socket.send_to(&BROADCAST_MAGIC.to_le_bytes(), target).await?;

    let mut buf = [0u8; 64];
    let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| DiscoveryError::Timeout(timeout))??;
    if len < 4 {
        return Err(DiscoveryError::ShortReply(from));
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != BROADCAST_MAGIC {
        return Err(DiscoveryError::WrongMagic { from, magic });
    }

    log::info!("Console found at {}", from.ip());
    Ok(from.ip())
}
