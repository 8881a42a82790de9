//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "TCP stream messenger."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::Messenger;
use crate::controller::ControllerInfo;
use crate::error::{CommError, Result};

/// Messenger over a single TCP stream.
#[derive(Debug)]
pub struct TcpMessenger {
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpMessenger {
    /// Create a closed messenger for `host:port`.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(CommError::Disconnected)
    }
}

#[async_trait]
impl Messenger for TcpMessenger {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| CommError::Timeout(self.timeout))?
            .map_err(|err| CommError::Connect(format!("{}: {err}", self.addr)))?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "tcp messenger connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, _ctl: &ControllerInfo, frame: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, _ctl: &ControllerInfo, buf: &mut BytesMut) -> Result<usize> {
        let limit = self.timeout;
        let stream = self.stream()?;
        let n = timeout(limit, stream.read_buf(buf))
            .await
            .map_err(|_| CommError::Timeout(limit))??;
        if n == 0 {
            return Err(CommError::Disconnected);
        }
        Ok(n)
    }

    async fn drain(&mut self) -> Result<()> {
        let stream = self.stream()?;
        let mut scratch = [0u8; 512];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => return Err(CommError::Disconnected),
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(addr = %self.addr, "tcp messenger closed");
        }
    }
}
