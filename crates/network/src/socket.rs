//! UDP socket setup and local address helpers

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

fn new_udp_socket() -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a reusable UDP socket, optionally allowed to send broadcasts
pub fn bind_udp(addr: SocketAddr, broadcast: bool) -> std::io::Result<UdpSocket> {
    let socket = new_udp_socket()?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Bind `0.0.0.0:port` and join an IPv4 multicast group
pub fn bind_multicast(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = new_udp_socket()?;
    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    UdpSocket::from_std(socket.into())
}

/// Local address the OS would use to reach `peer`.
///
/// No packet is sent; connecting a UDP socket only selects a route.
pub fn local_ip_for(peer: IpAddr) -> std::io::Result<IpAddr> {
    let bind: SocketAddr = match peer {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = StdUdpSocket::bind(bind)?;
    socket.connect(SocketAddr::new(peer, 9))?;
    Ok(socket.local_addr()?.ip())
}

/// Primary outbound address of this host, `127.0.0.1` when offline
pub fn local_ip() -> IpAddr {
    local_ip_for(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
