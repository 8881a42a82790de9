//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Transports shared by every controller on a comm link."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use url::Url;

use crate::config::LinkConfig;
use crate::controller::ControllerInfo;
use crate::error::{CommError, Result};

pub mod http;
pub mod memory;
pub mod tcp;
pub mod udp;

pub use http::HttpMessenger;
pub use memory::{MemoryMessenger, Reply, Responder};
pub use tcp::TcpMessenger;
pub use udp::UdpMessenger;

/// Byte transport owned by one comm task.
///
/// Every exchange carries the addressed controller so multidrop transports can select
/// the right stream.
#[async_trait]
pub trait Messenger: Send {
    /// Transport name for logs.
    fn kind(&self) -> &'static str;

    /// Open the transport. Reopening an open transport is a no-op.
    async fn connect(&mut self) -> Result<()>;

    /// Whether the transport is open.
    fn is_connected(&self) -> bool;

    /// Write one request frame.
    async fn send(&mut self, ctl: &ControllerInfo, frame: &[u8]) -> Result<()>;

    /// Append available response bytes to `buf`, waiting at most the link timeout.
    async fn recv(&mut self, ctl: &ControllerInfo, buf: &mut BytesMut) -> Result<usize>;

    /// Discard any buffered input.
    async fn drain(&mut self) -> Result<()>;

    /// Close the transport.
    async fn close(&mut self);
}

/// Builds messengers from link URIs.
///
/// `mem://<name>` links resolve to responders registered beforehand; these back the
/// simulator and tests.
#[derive(Clone, Default)]
pub struct MessengerFactory {
    responders: Arc<RwLock<HashMap<String, Arc<dyn Responder>>>>,
}

impl MessengerFactory {
    /// Create a factory without in-memory responders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the responder behind `mem://<name>`.
    pub fn register_responder(&self, name: impl Into<String>, responder: Arc<dyn Responder>) {
        self.responders.write().insert(name.into(), responder);
    }

    /// Create the messenger for a link, applying `default_scheme` to bare `host:port` URIs.
    pub fn create(&self, config: &LinkConfig, default_scheme: &str) -> Result<Box<dyn Messenger>> {
        let url = parse_uri(&config.uri, default_scheme)?;
        let timeout = config.timeout;
        match url.scheme() {
            "tcp" => Ok(Box::new(TcpMessenger::new(socket_addr(&url)?, timeout))),
            "udp" => Ok(Box::new(UdpMessenger::new(socket_addr(&url)?, timeout))),
            "http" | "https" => Ok(Box::new(HttpMessenger::new(url, timeout))),
            "mem" => {
                let name = url
                    .host_str()
                    .ok_or_else(|| CommError::InvalidAddress(config.uri.clone()))?;
                let responder = self
                    .responders
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        CommError::InvalidAddress(format!("no responder registered for {name}"))
                    })?;
                Ok(Box::new(MemoryMessenger::new(responder, timeout)))
            }
            other => Err(CommError::InvalidAddress(format!(
                "unsupported scheme {other} in {}",
                config.uri
            ))),
        }
    }
}

impl std::fmt::Debug for MessengerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerFactory")
            .field("responders", &self.responders.read().len())
            .finish()
    }
}

/// Parse a link URI, prefixing `default_scheme` when none is given.
pub fn parse_uri(uri: &str, default_scheme: &str) -> Result<Url> {
    let full = if uri.contains("://") {
        uri.to_owned()
    } else {
        format!("{default_scheme}://{uri}")
    };
    Url::parse(&full).map_err(|err| CommError::InvalidAddress(format!("{uri}: {err}")))
}

fn socket_addr(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| CommError::InvalidAddress(format!("{url}: missing host")))?;
    let port = url
        .port()
        .ok_or_else(|| CommError::InvalidAddress(format!("{url}: missing port")))?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_uri_gets_default_scheme() {
        let url = parse_uri("10.1.2.3:8001", "tcp").unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(socket_addr(&url).unwrap(), "10.1.2.3:8001");
        let url = parse_uri("http://wx.example/feed.json", "tcp").unwrap();
        assert_eq!(url.scheme(), "http");
    }

    #[test]
    fn factory_rejects_unknown_scheme_and_missing_port() {
        let factory = MessengerFactory::new();
        let config = LinkConfig::new("line-1", "modem://dialup", "relay");
        assert!(matches!(
            factory.create(&config, "tcp"),
            Err(CommError::InvalidAddress(_))
        ));
        let config = LinkConfig::new("line-1", "10.1.2.3", "relay");
        assert!(matches!(
            factory.create(&config, "tcp"),
            Err(CommError::InvalidAddress(_))
        ));
    }

    #[test]
    fn memory_links_resolve_registered_responders() {
        let factory = MessengerFactory::new();
        factory.register_responder(
            "sim",
            Arc::new(|_: &ControllerInfo, _: &[u8]| Reply::Frame(b"OK\r\n".to_vec())),
        );
        let config = LinkConfig::new("line-1", "mem://sim", "relay");
        let messenger = factory.create(&config, "tcp").unwrap();
        assert_eq!(messenger.kind(), "memory");
        let config = LinkConfig::new("line-2", "mem://missing", "relay");
        assert!(factory.create(&config, "tcp").is_err());
    }
}
