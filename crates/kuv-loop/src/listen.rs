//! Listener socket setup
//!
//! TCP endpoints go through `socket2` so the backlog and `SO_REUSEADDR`
//! are explicit. The internal pipe is a Unix domain socket at a path.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;

use kuv_core::{Result, UvError};
use mio::net::{TcpListener, UnixListener, UnixStream};
use socket2::{Domain, Protocol, Socket, Type};

/// Bind and listen on a TCP endpoint, non-blocking
pub fn bind_tcp(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| UvError::from_io("socket", &e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| UvError::from_io("setsockopt", &e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| UvError::from_io("set_nonblocking", &e))?;
    socket.bind(&addr.into()).map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => UvError::AddressInUse(addr),
        _ => UvError::from_io("bind", &e),
    })?;
    socket
        .listen(backlog)
        .map_err(|e| UvError::from_io("listen", &e))?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

/// Bind the internal pipe at `path`
pub fn bind_pipe(path: &Path) -> Result<UnixListener> {
    UnixListener::bind(path).map_err(|e| UvError::from_io("pipe_bind", &e))
}

/// Connect to the internal pipe and send `handshake`
///
/// The connect and the handshake write are done blocking (the peer is a
/// local socket with room for a few bytes); the stream is switched to
/// non-blocking before it is returned.
pub fn connect_pipe(path: &Path, handshake: &[u8]) -> Result<UnixStream> {
    let mut stream =
        StdUnixStream::connect(path).map_err(|e| UvError::from_io("pipe_connect", &e))?;
    stream
        .write_all(handshake)
        .map_err(|e| UvError::from_io("pipe_write", &e))?;
    stream
        .set_nonblocking(true)
        .map_err(|e| UvError::from_io("set_nonblocking", &e))?;
    Ok(UnixStream::from_std(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_bind_tcp_port_zero() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }

    #[test]
    fn test_bind_tcp_address_in_use() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();
        match bind_tcp(addr, 128) {
            Err(UvError::AddressInUse(a)) => assert_eq!(a, addr),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("second bind succeeded"),
        }
    }

    #[test]
    fn test_pipe_connect_sends_handshake() {
        let path = std::env::temp_dir().join(format!("kuv_listen_test_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let _client = connect_pipe(&path, b"secret").unwrap();
        let (mut server, _) = std_listener.accept().unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"secret");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_pipe_connect_missing_path() {
        let path = std::env::temp_dir().join("kuv_listen_test_missing_pipe");
        let _ = std::fs::remove_file(&path);
        assert!(connect_pipe(&path, b"x").is_err());
    }
}
