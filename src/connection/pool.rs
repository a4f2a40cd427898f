use super::Connection;
use super::auth::Credentials;
use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Connection pool
///
/// Bounded set of blocking connections to one node. Idle connections live in
/// a deque: checkin pushes to the front and checkout pops from the front, so
/// the back holds the connections idle the longest.
pub struct ConnectionPool {
    /// Available connections
    idle: Mutex<VecDeque<Connection>>,
    /// Idle plus checked-out connections
    total: AtomicUsize,
    min_size: AtomicUsize,
    max_size: AtomicUsize,
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    credentials: Option<Arc<Credentials>>,
}

impl ConnectionPool {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            min_size: AtomicUsize::new(min_size.min(max_size)),
            max_size: AtomicUsize::new(max_size),
            next_id: AtomicU64::new(1),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            credentials: None,
        }
    }

    /// Logs every new connection in with `credentials`.
    pub fn with_credentials(mut self, credentials: Option<Arc<Credentials>>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Get a connection from the pool
    ///
    /// Reuses an idle connection when a live one is available, otherwise
    /// opens a new one while the pool is under its cap.
    pub fn checkout(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<PoolGuard<'_>> {
        while let Some(conn) = self.pop_idle()? {
            if conn.is_alive() {
                return Ok(PoolGuard::new(self, conn));
            }
            log::debug!("discarding dead pooled connection {} to {}", conn.id(), addr);
            self.discard(conn);
        }

        if !self.try_reserve() {
            return Err(DbError::ConnectionExhausted(format!(
                "{} ({} connections in use)",
                addr,
                self.max_size.load(Ordering::Acquire)
            )));
        }

        match self.open(addr, connect_timeout) {
            Ok(conn) => Ok(PoolGuard::new(self, conn)),
            Err(err) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Closes idle connections older than `idle_threshold`, oldest first and
    /// never below the minimum size, then opens connections until the
    /// minimum is reached again. Returns how many connections were closed.
    pub fn trim(
        &self,
        idle_threshold: Duration,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<usize> {
        let min = self.min_size.load(Ordering::Acquire);
        let mut expired = Vec::new();
        {
            let mut idle = self.idle.lock()?;
            while self.total.load(Ordering::Acquire).saturating_sub(expired.len()) > min {
                match idle.back() {
                    Some(conn) if conn.idle_for() >= idle_threshold => {
                        if let Some(conn) = idle.pop_back() {
                            expired.push(conn);
                        }
                    }
                    _ => break,
                }
            }
        }
        let trimmed = expired.len();
        for conn in expired {
            self.discard(conn);
        }

        while self.total.load(Ordering::Acquire) < min {
            if !self.try_reserve() {
                break;
            }
            match self.open(addr, connect_timeout) {
                Ok(conn) => self.idle.lock()?.push_back(conn),
                Err(err) => {
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }

        Ok(trimmed)
    }

    /// Closes every idle connection. Checked-out connections close on return.
    pub fn close_idle(&self) -> usize {
        let drained: Vec<Connection> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let count = drained.len();
        for conn in drained {
            self.discard(conn);
        }
        count
    }

    pub fn set_limits(&self, min_size: usize, max_size: usize) {
        self.max_size.store(max_size, Ordering::Release);
        self.min_size.store(min_size.min(max_size), Ordering::Release);
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        let total = self.total.load(Ordering::Acquire);

        PoolStats {
            total_connections: total,
            idle_connections: idle,
            in_use_connections: total.saturating_sub(idle),
            max_connections: self.max_size.load(Ordering::Acquire),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    fn pop_idle(&self) -> Result<Option<Connection>> {
        Ok(self.idle.lock()?.pop_front())
    }

    fn try_reserve(&self) -> bool {
        let max = self.max_size.load(Ordering::Acquire);
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok()
    }

    fn open(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = Connection::open(id, addr, connect_timeout)?;
        if let Some(credentials) = &self.credentials {
            conn.set_timeout(connect_timeout)?;
            conn.login(credentials)?;
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn checkin(&self, mut conn: Connection) {
        conn.touch();
        let max = self.max_size.load(Ordering::Acquire);
        let rejected = match self.idle.lock() {
            Ok(mut idle) if idle.len() < max && self.total.load(Ordering::Acquire) <= max => {
                idle.push_front(conn);
                None
            }
            _ => Some(conn),
        };
        if let Some(conn) = rejected {
            self.discard(conn);
        }
    }

    fn discard(&self, conn: Connection) {
        conn.close();
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub in_use_connections: usize,
    pub max_connections: usize,
    pub opened: u64,
    pub closed: u64,
}

impl PoolStats {
    pub fn merge(&mut self, other: &PoolStats) {
        self.total_connections += other.total_connections;
        self.idle_connections += other.idle_connections;
        self.in_use_connections += other.in_use_connections;
        self.max_connections += other.max_connections;
        self.opened += other.opened;
        self.closed += other.closed;
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} in use, {} idle, max {} (opened {}, closed {})",
            self.in_use_connections,
            self.total_connections,
            self.idle_connections,
            self.max_connections,
            self.opened,
            self.closed
        )
    }
}

/// RAII guard for a checked-out connection
///
/// `checkin` returns the connection for reuse; dropping the guard without
/// it closes the connection, which is what every error path wants.
pub struct PoolGuard<'a> {
    pool: &'a ConnectionPool,
    connection: Option<Connection>,
}

impl<'a> PoolGuard<'a> {
    fn new(pool: &'a ConnectionPool, connection: Connection) -> Self {
        Self {
            pool,
            connection: Some(connection),
        }
    }

    /// Get a reference to the connection
    pub fn connection(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::Fatal("connection already released".to_string()))
    }

    pub fn checkin(mut self) {
        if let Some(conn) = self.connection.take() {
            self.pool.checkin(conn);
        }
    }

    pub fn close(mut self) {
        if let Some(conn) = self.connection.take() {
            self.pool.discard(conn);
        }
    }
}

impl std::fmt::Debug for PoolGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("connection", &self.connection)
            .finish()
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.pool.discard(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::auth::ADMIN_HEADER_SIZE;
    use crate::core::{ErrorKind, ResultCode};
    use crate::protocol::{FrameHeader, HEADER_SIZE, MessageType, encode_frame};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn listener(accepts: usize) -> (SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut held = Vec::new();
            for socket in listener.incoming().take(accepts) {
                held.push(socket.unwrap());
            }
            thread::sleep(Duration::from_millis(300));
        });
        (addr, handle)
    }

    #[test]
    fn test_third_checkout_is_exhausted_until_checkin() {
        let (addr, server) = listener(2);
        let pool = ConnectionPool::new(0, 2);
        let timeout = Duration::from_secs(1);

        let first = pool.checkout(addr, timeout).unwrap();
        let second = pool.checkout(addr, timeout).unwrap();
        assert!(matches!(
            pool.checkout(addr, timeout),
            Err(DbError::ConnectionExhausted(_))
        ));

        first.checkin();
        let third = pool.checkout(addr, timeout).unwrap();
        assert_eq!(pool.stats().total_connections, 2);
        assert_eq!(pool.stats().opened, 2);

        drop(third);
        second.close();
        assert_eq!(pool.stats().total_connections, 0);
        server.join().unwrap();
    }

    #[test]
    fn test_trim_keeps_minimum() {
        let (addr, server) = listener(2);
        let pool = ConnectionPool::new(1, 4);
        let timeout = Duration::from_secs(1);

        let a = pool.checkout(addr, timeout).unwrap();
        let b = pool.checkout(addr, timeout).unwrap();
        a.checkin();
        b.checkin();
        assert_eq!(pool.stats().idle_connections, 2);

        let trimmed = pool.trim(Duration::ZERO, addr, timeout).unwrap();
        assert_eq!(trimmed, 1);
        assert_eq!(pool.stats().total_connections, 1);
        server.join().unwrap();
    }

    #[test]
    fn test_failed_open_releases_slot() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let pool = ConnectionPool::new(0, 1);
        assert!(pool.checkout(addr, Duration::from_millis(200)).is_err());
        assert_eq!(pool.stats().total_connections, 0);
    }

    /// Answers one login per connection with `code`.
    fn login_server(connections: usize, code: ResultCode) -> (SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut held = Vec::new();
            for socket in listener.incoming().take(connections) {
                let mut socket = socket.unwrap();
                let mut raw = [0u8; HEADER_SIZE];
                socket.read_exact(&mut raw).unwrap();
                let header = FrameHeader::decode(&raw).unwrap();
                assert_eq!(header.msg_type, MessageType::Admin);
                let mut body = vec![0u8; header.body_len as usize];
                socket.read_exact(&mut body).unwrap();

                let mut reply = [0u8; ADMIN_HEADER_SIZE];
                reply[1] = code.0 as u8;
                socket
                    .write_all(&encode_frame(MessageType::Admin, &reply).unwrap())
                    .unwrap();
                held.push(socket);
            }
            thread::sleep(Duration::from_millis(200));
        });
        (addr, handle)
    }

    #[test]
    fn test_new_connection_logs_in() {
        let (addr, server) = login_server(1, ResultCode::OK);
        let credentials = Credentials::new("admin", "secret").unwrap();
        let pool = ConnectionPool::new(0, 1).with_credentials(Some(Arc::new(credentials)));

        let guard = pool.checkout(addr, Duration::from_secs(1)).unwrap();
        guard.checkin();
        assert_eq!(pool.stats().opened, 1);
        server.join().unwrap();
    }

    #[test]
    fn test_rejected_login_releases_slot() {
        let (addr, server) = login_server(1, ResultCode::INVALID_PASSWORD);
        let credentials = Credentials::new("admin", "wrong").unwrap();
        let pool = ConnectionPool::new(0, 1).with_credentials(Some(Arc::new(credentials)));

        let err = pool.checkout(addr, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(err.result_code(), Some(ResultCode::INVALID_PASSWORD));
        assert_eq!(pool.stats().total_connections, 0);
        server.join().unwrap();
    }
}
