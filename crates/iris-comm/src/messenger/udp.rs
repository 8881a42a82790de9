//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "UDP datagram messenger."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::Messenger;
use crate::controller::ControllerInfo;
use crate::error::{CommError, Result};

const MAX_DATAGRAM: usize = 2048;

/// Messenger sending one datagram per request.
#[derive(Debug)]
pub struct UdpMessenger {
    addr: String,
    timeout: Duration,
    socket: Option<UdpSocket>,
}

impl UdpMessenger {
    /// Create a closed messenger for `host:port`.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            socket: None,
        }
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(CommError::Disconnected)
    }
}

#[async_trait]
impl Messenger for UdpMessenger {
    fn kind(&self) -> &'static str {
        "udp"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&self.addr)
            .await
            .map_err(|err| CommError::Connect(format!("{}: {err}", self.addr)))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn send(&mut self, _ctl: &ControllerInfo, frame: &[u8]) -> Result<()> {
        self.socket()?.send(frame).await?;
        Ok(())
    }

    async fn recv(&mut self, _ctl: &ControllerInfo, buf: &mut BytesMut) -> Result<usize> {
        let limit = self.timeout;
        let socket = self.socket()?;
        let mut datagram = [0u8; MAX_DATAGRAM];
        let n = timeout(limit, socket.recv(&mut datagram))
            .await
            .map_err(|_| CommError::Timeout(limit))??;
        buf.extend_from_slice(&datagram[..n]);
        Ok(n)
    }

    async fn drain(&mut self) -> Result<()> {
        let socket = self.socket()?;
        let mut datagram = [0u8; MAX_DATAGRAM];
        loop {
            match socket.try_recv(&mut datagram) {
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn close(&mut self) {
        self.socket = None;
    }
}
