use crate::connection::auth::check_login_reply;
use crate::connection::{Credentials, Host};
use crate::core::{DbError, Result};
use crate::protocol::frame::MessageType;
use crate::protocol::info::{InfoMap, encode_info_request, parse_info_response};
use crate::protocol::{FrameHeader, HEADER_SIZE};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Channel the tend loop uses to reach node info endpoints.
#[async_trait]
pub trait InfoTransport: Send + Sync {
    /// Resolves a seed or peer host into socket addresses.
    async fn resolve(&self, host: &Host) -> Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host.name.as_str(), host.port))
            .await
            .map_err(|e| DbError::IoError(format!("resolve {}: {}", host, e)))?;
        Ok(addrs.collect())
    }

    /// Sends one info request and returns the parsed reply.
    async fn request(&self, addr: SocketAddr, names: &[&str], timeout: Duration) -> Result<InfoMap>;
}

/// Info requests over a fresh TCP connection each time.
#[derive(Debug, Clone, Default)]
pub struct TcpInfoTransport {
    credentials: Option<Arc<Credentials>>,
}

impl TcpInfoTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every info connection in with `credentials` before the request.
    pub fn with_credentials(credentials: Option<Arc<Credentials>>) -> Self {
        Self { credentials }
    }

    async fn exchange(&self, addr: SocketAddr, request: &[u8]) -> Result<InfoMap> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        if let Some(credentials) = &self.credentials {
            stream.write_all(&credentials.login_request()?).await?;
            let body = read_frame(&mut stream, MessageType::Admin).await?;
            check_login_reply(&body)?;
        }

        stream.write_all(request).await?;
        let body = read_frame(&mut stream, MessageType::Info).await?;
        parse_info_response(&body)
    }
}

async fn read_frame(stream: &mut TcpStream, msg_type: MessageType) -> Result<Vec<u8>> {
    let mut raw = [0u8; HEADER_SIZE];
    stream.read_exact(&mut raw).await?;
    let header = FrameHeader::decode(&raw)?;
    header.expect(msg_type)?;

    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

#[async_trait]
impl InfoTransport for TcpInfoTransport {
    async fn request(&self, addr: SocketAddr, names: &[&str], timeout: Duration) -> Result<InfoMap> {
        let request = encode_info_request(names)?;
        tokio::time::timeout(timeout, self.exchange(addr, &request))
            .await
            .map_err(|_| DbError::Timeout(format!("info request to {}", addr)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::auth::ADMIN_HEADER_SIZE;
    use crate::protocol::encode_frame;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; HEADER_SIZE];
            socket.read_exact(&mut header).await.unwrap();
            let header = FrameHeader::decode(&header).unwrap();
            let mut body = vec![0u8; header.body_len as usize];
            socket.read_exact(&mut body).await.unwrap();
            assert_eq!(body, b"node\n");
            let reply = encode_frame(MessageType::Info, b"node\tA1\n").unwrap();
            socket.write_all(&reply).await.unwrap();
        });

        let map = TcpInfoTransport::new()
            .request(addr, &["node"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(map.get("node").map(String::as_str), Some("A1"));
    }

    async fn read_request(socket: &mut TcpStream) -> (FrameHeader, Vec<u8>) {
        let mut raw = [0u8; HEADER_SIZE];
        socket.read_exact(&mut raw).await.unwrap();
        let header = FrameHeader::decode(&raw).unwrap();
        let mut body = vec![0u8; header.body_len as usize];
        socket.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn test_login_precedes_info_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (header, _) = read_request(&mut socket).await;
            assert_eq!(header.msg_type, MessageType::Admin);
            let ok = encode_frame(MessageType::Admin, &[0u8; ADMIN_HEADER_SIZE]).unwrap();
            socket.write_all(&ok).await.unwrap();

            let (header, body) = read_request(&mut socket).await;
            assert_eq!(header.msg_type, MessageType::Info);
            assert_eq!(body, b"node\n");
            let reply = encode_frame(MessageType::Info, b"node\tA1\n").unwrap();
            socket.write_all(&reply).await.unwrap();
        });

        let credentials = Credentials::new("admin", "secret").unwrap();
        let map = TcpInfoTransport::with_credentials(Some(Arc::new(credentials)))
            .request(addr, &["node"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(map.get("node").map(String::as_str), Some("A1"));
    }

    #[tokio::test]
    async fn test_rejected_login_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let mut reply = [0u8; ADMIN_HEADER_SIZE];
            reply[1] = crate::core::ResultCode::INVALID_PASSWORD.0 as u8;
            let frame = encode_frame(MessageType::Admin, &reply).unwrap();
            socket.write_all(&frame).await.unwrap();
        });

        let credentials = Credentials::new("admin", "wrong").unwrap();
        let err = TcpInfoTransport::with_credentials(Some(Arc::new(credentials)))
            .request(addr, &["node"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Fatal);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let err = TcpInfoTransport::new()
            .request(addr, &["node"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout(_)));
    }
}
