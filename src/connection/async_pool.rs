use super::auth::{Credentials, check_login_reply};
use super::pool::PoolStats;
use crate::core::{DbError, Result};
use crate::protocol::{Frame, FrameHeader, HEADER_SIZE, MessageType};
use futures::FutureExt;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Non-blocking data connection bound to one event loop.
pub struct AsyncConnection {
    id: u64,
    addr: SocketAddr,
    event_loop: usize,
    stream: TcpStream,
    last_used: Instant,
}

impl AsyncConnection {
    pub async fn open(
        id: u64,
        addr: SocketAddr,
        event_loop: usize,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = if connect_timeout.is_zero() {
            TcpStream::connect(addr).await?
        } else {
            tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| DbError::Timeout(format!("connect to {}", addr)))??
        };
        stream.set_nodelay(true)?;
        Ok(Self {
            id,
            addr,
            event_loop,
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

    /// Index of the event loop whose reactor owns this socket.
    pub fn event_loop(&self) -> usize {
        self.event_loop
    }

    /// Polls a peek exactly once: a pending read means the socket is idle
    /// and usable, anything else (EOF, stray bytes, error) means it is not.
    pub fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        self.stream.peek(&mut probe).now_or_never().is_none()
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_header(&mut self, expected: MessageType) -> Result<FrameHeader> {
        let mut raw = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut raw).await?;
        let header = FrameHeader::decode(&raw)?;
        header.expect(expected)?;
        Ok(header)
    }

    pub async fn read_body(&mut self, header: FrameHeader) -> Result<Frame> {
        let len = usize::try_from(header.body_len)
            .map_err(|_| DbError::Protocol(format!("body length {} too large", header.body_len)))?;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        self.touch();
        Ok(Frame { header, body })
    }

    pub async fn read_frame(&mut self, expected: MessageType) -> Result<Frame> {
        let header = self.read_header(expected).await?;
        self.read_body(header).await
    }

    /// Authenticates a freshly opened connection.
    pub async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.write_all(&credentials.login_request()?).await?;
        let reply = self.read_frame(MessageType::Admin).await?;
        check_login_reply(&reply.body)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// Per-event-loop pool of async connections to one node.
///
/// Same bookkeeping as the blocking pool. The queue lock is never held
/// across an await point.
pub struct AsyncConnectionPool {
    event_loop: usize,
    idle: Mutex<VecDeque<AsyncConnection>>,
    total: AtomicUsize,
    min_size: AtomicUsize,
    max_size: AtomicUsize,
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    credentials: Option<Arc<Credentials>>,
}

impl AsyncConnectionPool {
    pub fn new(event_loop: usize, min_size: usize, max_size: usize) -> Self {
        Self {
            event_loop,
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

    pub fn event_loop(&self) -> usize {
        self.event_loop
    }

    /// Exhaustion is reported as `ConnectionExhausted`, which the executor
    /// retries like a timeout.
    pub async fn checkout(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<AsyncPoolGuard<'_>> {
        while let Some(conn) = self.pop_idle()? {
            if conn.is_alive() {
                return Ok(AsyncPoolGuard::new(self, conn));
            }
            log::debug!(
                "discarding dead async connection {} to {} on loop {}",
                conn.id(),
                addr,
                self.event_loop
            );
            self.discard(conn);
        }

        if !self.try_reserve() {
            return Err(DbError::ConnectionExhausted(format!(
                "{} on event loop {}",
                addr, self.event_loop
            )));
        }

        match self.open(addr, connect_timeout).await {
            Ok(conn) => Ok(AsyncPoolGuard::new(self, conn)),
            Err(err) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Opens connections until the minimum size is reached.
    pub async fn fill(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<usize> {
        let min = self.min_size.load(Ordering::Acquire);
        let mut created = 0;
        while self.total.load(Ordering::Acquire) < min {
            if !self.try_reserve() {
                break;
            }
            match self.open(addr, connect_timeout).await {
                Ok(conn) => {
                    self.idle.lock()?.push_back(conn);
                    created += 1;
                }
                Err(err) => {
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }
        Ok(created)
    }

    /// Closes idle connections older than the threshold, down to the minimum.
    pub fn trim(&self, idle_threshold: Duration) -> Result<usize> {
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
        Ok(trimmed)
    }

    pub fn close_idle(&self) -> usize {
        let drained: Vec<AsyncConnection> = match self.idle.lock() {
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

    fn pop_idle(&self) -> Result<Option<AsyncConnection>> {
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

    async fn open(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<AsyncConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = AsyncConnection::open(id, addr, self.event_loop, connect_timeout).await?;
        if let Some(credentials) = &self.credentials {
            if connect_timeout.is_zero() {
                conn.login(credentials).await?;
            } else {
                tokio::time::timeout(connect_timeout, conn.login(credentials))
                    .await
                    .map_err(|_| DbError::Timeout(format!("login to {}", addr)))??;
            }
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn checkin(&self, mut conn: AsyncConnection) {
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

    fn discard(&self, conn: AsyncConnection) {
        drop(conn);
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Checked-out async connection; closes on drop unless checked in.
pub struct AsyncPoolGuard<'a> {
    pool: &'a AsyncConnectionPool,
    connection: Option<AsyncConnection>,
}

impl<'a> AsyncPoolGuard<'a> {
    fn new(pool: &'a AsyncConnectionPool, connection: AsyncConnection) -> Self {
        Self {
            pool,
            connection: Some(connection),
        }
    }

    pub fn connection(&mut self) -> Result<&mut AsyncConnection> {
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

impl Drop for AsyncPoolGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.pool.discard(conn);
        }
    }
}
