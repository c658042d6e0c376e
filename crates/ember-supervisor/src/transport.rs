use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::atomic::{AtomicI32, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::ShutdownError;

const OP_QUERY: i32 = 2004;
const OP_MSG: i32 = 2013;
const MAX_REPLY_BYTES: usize = 16 * 1024 * 1024;

/// Framing of the administrative command on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WireProtocol {
    /// Legacy `OP_QUERY` against `admin.$cmd`.
    LegacyQuery,
    /// `OP_MSG` with a `$db` field.
    OpMsg,
}

/// Delivers the administrative stop command to a running server.
#[async_trait::async_trait]
pub trait ShutdownTransport: Send + Sync {
    async fn send_shutdown(&self, addr: SocketAddr, wire: WireProtocol) -> Result<(), ShutdownError>;
}

/// Sends `{shutdown: 1}` to the `admin` database over a plain TCP connection.
#[derive(Debug, Clone)]
pub struct AdminCommandTransport {
    io_timeout: Duration,
}

impl Default for AdminCommandTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl AdminCommandTransport {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }

    async fn exchange(&self, addr: SocketAddr, message: &[u8]) -> Result<(), ShutdownError> {
        let mut stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ShutdownError::Timeout(self.io_timeout))?
            .map_err(|e| ShutdownError::Connect { addr, source: e })?;

        stream.write_all(message).await.map_err(map_io)?;
        stream.flush().await.map_err(map_io)?;

        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.map_err(map_io)?;
        let total = i32::from_le_bytes(len);
        let body = usize::try_from(total)
            .ok()
            .and_then(|t| t.checked_sub(4))
            .filter(|b| *b <= MAX_REPLY_BYTES)
            .ok_or_else(|| {
                ShutdownError::Io(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("bad reply length {total}"),
                ))
            })?;
        let mut rest = vec![0u8; body];
        stream.read_exact(&mut rest).await.map_err(map_io)?;
        tracing::debug!(%addr, bytes = total, "shutdown command answered");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ShutdownTransport for AdminCommandTransport {
    async fn send_shutdown(&self, addr: SocketAddr, wire: WireProtocol) -> Result<(), ShutdownError> {
        let message = encode_shutdown(wire, next_request_id());
        match tokio::time::timeout(self.io_timeout * 2, self.exchange(addr, &message)).await {
            Ok(res) => res,
            Err(_) => Err(ShutdownError::Timeout(self.io_timeout * 2)),
        }
    }
}

fn map_io(e: io::Error) -> ShutdownError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            ShutdownError::PeerReset
        }
        _ => ShutdownError::Io(e),
    }
}

fn next_request_id() -> i32 {
    static NEXT: AtomicI32 = AtomicI32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub fn encode_shutdown(wire: WireProtocol, request_id: i32) -> Vec<u8> {
    match wire {
        WireProtocol::OpMsg => {
            let doc = Document::new().int32("shutdown", 1).string("$db", "admin").finish();
            let mut body = Vec::with_capacity(doc.len() + 5);
            body.extend_from_slice(&0u32.to_le_bytes());
            body.push(0);
            body.extend_from_slice(&doc);
            frame(OP_MSG, request_id, &body)
        }
        WireProtocol::LegacyQuery => {
            let doc = Document::new().int32("shutdown", 1).finish();
            let mut body = Vec::with_capacity(doc.len() + 24);
            body.extend_from_slice(&0i32.to_le_bytes());
            push_cstring(&mut body, "admin.$cmd");
            body.extend_from_slice(&0i32.to_le_bytes());
            body.extend_from_slice(&(-1i32).to_le_bytes());
            body.extend_from_slice(&doc);
            frame(OP_QUERY, request_id, &body)
        }
    }
}

fn frame(op_code: i32, request_id: i32, body: &[u8]) -> Vec<u8> {
    let len = (16 + body.len()) as i32;
    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&op_code.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn push_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Just enough BSON for flat command documents.
struct Document {
    elements: Vec<u8>,
}

impl Document {
    fn new() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    fn int32(mut self, key: &str, value: i32) -> Self {
        self.elements.push(0x10);
        push_cstring(&mut self.elements, key);
        self.elements.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn string(mut self, key: &str, value: &str) -> Self {
        self.elements.push(0x02);
        push_cstring(&mut self.elements, key);
        self.elements
            .extend_from_slice(&((value.len() + 1) as i32).to_le_bytes());
        push_cstring(&mut self.elements, value);
        self
    }

    fn finish(self) -> Vec<u8> {
        let len = (4 + self.elements.len() + 1) as i32;
        let mut out = Vec::with_capacity(len as usize);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.elements);
        out.push(0);
        out
    }
}
