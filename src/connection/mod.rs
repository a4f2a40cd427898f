pub mod async_pool;
pub mod auth;
pub mod config;
pub mod policy;
pub mod pool;

use auth::check_login_reply;
use crate::core::{DbError, Result};
use crate::protocol::{Frame, FrameHeader, HEADER_SIZE, MessageType};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

pub use async_pool::{AsyncConnection, AsyncConnectionPool, AsyncPoolGuard};
pub use auth::Credentials;
pub use config::{ClientConfig, Host, RuntimeOptions};
pub use policy::{CommandPolicy, Replica};
pub use pool::{ConnectionPool, PoolGuard, PoolStats};

/// Blocking data connection to one node
///
/// Owned by exactly one pool while idle, or by the command that checked it out.
pub struct Connection {
    /// Unique connection ID within its pool
    id: u64,
    addr: SocketAddr,
    stream: TcpStream,
    last_used: Instant,
}

impl Connection {
    /// Open a new connection; a zero timeout waits for the OS default.
    pub fn open(id: u64, addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let stream = if connect_timeout.is_zero() {
            TcpStream::connect(addr)?
        } else {
            TcpStream::connect_timeout(&addr, connect_timeout)?
        };
        stream.set_nodelay(true)?;
        Ok(Self {
            id,
            addr,
            stream,
            last_used: Instant::now(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Non-blocking liveness probe.
    ///
    /// An idle connection must have nothing to read: EOF or unsolicited
    /// bytes both mean the socket cannot be reused.
    pub fn is_alive(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match self.stream.peek(&mut probe) {
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
            Ok(_) => false,
        };
        alive && self.stream.set_nonblocking(false).is_ok()
    }

    /// Applies a read/write timeout; zero disables it.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    /// Reads one frame header, checking it against the expected type.
    pub fn read_header(&mut self, expected: MessageType) -> Result<FrameHeader> {
        let mut raw = [0u8; HEADER_SIZE];
        self.read_exact(&mut raw)?;
        let header = FrameHeader::decode(&raw)?;
        header.expect(expected)?;
        Ok(header)
    }

    /// Reads exactly the body a header declared.
    pub fn read_body(&mut self, header: FrameHeader) -> Result<Frame> {
        let len = usize::try_from(header.body_len)
            .map_err(|_| DbError::Protocol(format!("body length {} too large", header.body_len)))?;
        let mut body = vec![0u8; len];
        self.read_exact(&mut body)?;
        self.touch();
        Ok(Frame { header, body })
    }

    pub fn read_frame(&mut self, expected: MessageType) -> Result<Frame> {
        let header = self.read_header(expected)?;
        self.read_body(header)
    }

    /// Authenticates a freshly opened connection.
    pub fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.write_all(&credentials.login_request()?)?;
        let reply = self.read_frame(MessageType::Admin)?;
        check_login_reply(&reply.body)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_connection_reads_whole_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; HEADER_SIZE + 5];
            socket.read_exact(&mut request).unwrap();
            let reply = encode_frame(MessageType::Info, b"node\tA1\n").unwrap();
            socket.write_all(&reply).unwrap();
        });

        let mut conn = Connection::open(1, addr, Duration::from_secs(1)).unwrap();
        assert!(conn.is_alive());
        conn.set_timeout(Duration::from_secs(1)).unwrap();
        conn.write_all(&encode_frame(MessageType::Info, b"node\n").unwrap())
            .unwrap();
        let frame = conn.read_frame(MessageType::Info).unwrap();
        assert_eq!(frame.body, b"node\tA1\n");
        server.join().unwrap();
    }

    #[test]
    fn test_closed_peer_is_not_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let conn = Connection::open(1, addr, Duration::from_secs(1)).unwrap();
        server.join().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!conn.is_alive());
    }

    #[test]
    fn test_type_mismatch_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let reply = encode_frame(MessageType::Admin, b"x").unwrap();
            socket.write_all(&reply).unwrap();
        });

        let mut conn = Connection::open(1, addr, Duration::from_secs(1)).unwrap();
        let err = conn.read_frame(MessageType::Message).unwrap_err();
        assert!(matches!(err, DbError::Protocol(_)));
        server.join().unwrap();
    }
}
