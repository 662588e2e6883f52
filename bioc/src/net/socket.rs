//! Descriptor-level socket configuration.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;

use rustix::net::{sockopt, AddressFamily, SocketType};

use crate::config::KeepaliveConfig;

/// Creates a TCP listener with an explicit accept backlog and
/// `SO_REUSEADDR` set, so a restarted daemon can rebind immediately.
///
/// # Errors
///
/// Returns an error if the socket cannot be created, bound or put into the
/// listening state.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::INET,
        SocketAddr::V6(_) => AddressFamily::INET6,
    };
    let fd = rustix::net::socket(family, SocketType::STREAM, None)?;
    sockopt::set_socket_reuseaddr(&fd, true)?;
    rustix::net::bind(&fd, &addr)?;
    rustix::net::listen(&fd, backlog)?;
    Ok(TcpListener::from(fd))
}

/// Enables keepalive probing so dead peers are detected without traffic.
///
/// # Errors
///
/// Returns an error if any option is rejected by the kernel.
pub fn set_keepalive(stream: &TcpStream, keepalive: &KeepaliveConfig) -> io::Result<()> {
    let fd = stream.as_fd();
    sockopt::set_socket_keepalive(fd, true)?;
    sockopt::set_tcp_keepidle(fd, keepalive.idle)?;
    sockopt::set_tcp_keepintvl(fd, keepalive.interval)?;
    sockopt::set_tcp_keepcnt(fd, keepalive.count)?;
    Ok(())
}

/// Switches any descriptor (socket, pipe, tty) in or out of non-blocking mode.
///
/// # Errors
///
/// Returns an error if the `FIONBIO` ioctl fails.
pub fn set_nonblocking(fd: impl AsFd, nonblocking: bool) -> io::Result<()> {
    rustix::io::ioctl_fionbio(fd, nonblocking)?;
    Ok(())
}
