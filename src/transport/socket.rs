//! Stream socket creation for path connections.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};

/// Socket options applied to every outgoing path socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    /// Local address to bind before connecting (port is chosen by the OS).
    pub bind: Option<SocketAddr>,
    /// Set TCP_NODELAY.
    pub nodelay: bool,
}

/// Create a non-blocking stream socket for `remote`.
///
/// The socket is not connected yet; pass it to [`connect`].
pub fn stream_socket(remote: SocketAddr, opts: SocketOptions) -> io::Result<TcpSocket> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(opts.nodelay)?;

    if let Some(local) = opts.bind {
        if local.is_ipv4() != remote.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "bind address family differs from remote",
            ));
        }
        socket.bind(&SocketAddr::new(local.ip(), 0).into())?;
    }

    Ok(TcpSocket::from_std_stream(socket.into()))
}

/// Connect a socket created by [`stream_socket`].
pub async fn connect(socket: TcpSocket, remote: SocketAddr) -> io::Result<TcpStream> {
    socket.connect(remote).await
}

/// Apply TCP_NODELAY to an accepted connection.
pub fn configure_accepted(stream: &TcpStream, nodelay: bool) -> io::Result<()> {
    SockRef::from(stream).set_nodelay(nodelay)
}

/// Whether an I/O error means the peer reset the connection.
pub fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Whether an I/O error means the peer closed the connection.
pub fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected
    )
}
