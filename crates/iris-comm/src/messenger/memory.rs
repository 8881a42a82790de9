//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "In-process messenger backed by a simulated device responder."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;

use super::Messenger;
use crate::controller::ControllerInfo;
use crate::error::{CommError, Result};

/// Simulated device reaction to one request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bytes returned on the wire.
    Frame(Vec<u8>),
    /// No answer; the read times out.
    Silent,
    /// The device drops the connection.
    Hangup,
}

/// Simulated device logic behind a `mem://` link.
pub trait Responder: Send + Sync {
    /// React to a request addressed to `ctl`.
    fn respond(&self, ctl: &ControllerInfo, request: &[u8]) -> Reply;

    /// Whether a connection attempt succeeds.
    fn accept(&self) -> bool {
        true
    }
}

impl<F> Responder for F
where
    F: Fn(&ControllerInfo, &[u8]) -> Reply + Send + Sync,
{
    fn respond(&self, ctl: &ControllerInfo, request: &[u8]) -> Reply {
        self(ctl, request)
    }
}

/// Messenger exchanging frames with a [`Responder`] in memory.
pub struct MemoryMessenger {
    responder: Arc<dyn Responder>,
    timeout: Duration,
    connected: bool,
    pending: BytesMut,
    hangup: bool,
}

impl MemoryMessenger {
    /// Create a closed messenger.
    pub fn new(responder: Arc<dyn Responder>, timeout: Duration) -> Self {
        Self {
            responder,
            timeout,
            connected: false,
            pending: BytesMut::new(),
            hangup: false,
        }
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        if !self.responder.accept() {
            return Err(CommError::Connect("connection refused".into()));
        }
        self.connected = true;
        self.hangup = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, ctl: &ControllerInfo, frame: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(CommError::Disconnected);
        }
        match self.responder.respond(ctl, frame) {
            Reply::Frame(bytes) => self.pending.extend_from_slice(&bytes),
            Reply::Silent => {}
            Reply::Hangup => self.hangup = true,
        }
        Ok(())
    }

    async fn recv(&mut self, _ctl: &ControllerInfo, buf: &mut BytesMut) -> Result<usize> {
        if !self.connected {
            return Err(CommError::Disconnected);
        }
        if !self.pending.is_empty() {
            let n = self.pending.len();
            buf.extend_from_slice(&self.pending.split());
            return Ok(n);
        }
        if self.hangup {
            self.connected = false;
            return Err(CommError::Disconnected);
        }
        tokio::time::sleep(self.timeout).await;
        Err(CommError::Timeout(self.timeout))
    }

    async fn drain(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
        self.pending.clear();
    }
}
