//! TCP transport for client and backend links.
//!
//! Frames are length-prefixed: a big-endian `u32` byte count followed by
//! the batch bytes. The read and write halves are independently locked so
//! the two pump directions never contend with each other.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proxy_protocol::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Connector, Link};
use crate::error::{ProxyError, TransferError};

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A length-prefixed TCP link.
pub struct TcpLink {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    compression: Compression,
    encrypted: bool,
    open: AtomicBool,
}

impl TcpLink {
    /// Wraps a connected stream with the given negotiated settings.
    pub fn new(stream: TcpStream, compression: Compression, encrypted: bool) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            compression,
            encrypted,
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send_batch(&self, frame: Vec<u8>) -> Result<(), ProxyError> {
        if !self.is_open() {
            return Err(ProxyError::Network("link is closed".to_string()));
        }
        let mut writer = self.writer.lock().await;
        let len = u32::try_from(frame.len())
            .map_err(|_| ProxyError::Network("frame exceeds u32 length".to_string()))?;
        let result = async {
            writer.write_all(&len.to_be_bytes()).await?;
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            ProxyError::Network(e.to_string())
        })
    }

    async fn recv_batch(&self) -> Result<Option<Vec<u8>>, ProxyError> {
        let mut reader = self.reader.lock().await;
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.open.store(false, Ordering::SeqCst);
                return Ok(None);
            }
            Err(e) => {
                self.open.store(false, Ordering::SeqCst);
                return Err(ProxyError::Network(e.to_string()));
            }
        }

        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            self.open.store(false, Ordering::SeqCst);
            return Err(ProxyError::Network(format!(
                "frame length {len} exceeds limit"
            )));
        }

        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            ProxyError::Network(e.to_string())
        })?;
        Ok(Some(frame))
    }

    fn compression(&self) -> Compression {
        self.compression
    }

    fn encryption_enabled(&self) -> bool {
        self.encrypted
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

/// Dials backends over TCP with a connect timeout.
pub struct TcpConnector {
    connect_timeout: Duration,
    compression: Compression,
    encrypted: bool,
}

impl TcpConnector {
    /// Creates a connector. Backend links carry the given negotiated
    /// compression and encryption settings.
    pub fn new(connect_timeout: Duration, compression: Compression, encrypted: bool) -> Self {
        Self {
            connect_timeout,
            compression,
            encrypted,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn Link>, TransferError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransferError::ConnectTimeout(addr.to_string()))?
            .map_err(|e| TransferError::BackendClosed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransferError::BackendClosed(e.to_string()))?;
        debug!(%addr, "backend connection established");
        Ok(Arc::new(TcpLink::new(stream, self.compression, self.encrypted)))
    }
}
