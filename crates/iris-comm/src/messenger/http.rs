//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "HTTP messenger polling a static file per round trip."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::Client;
use url::Url;

use super::Messenger;
use crate::controller::ControllerInfo;
use crate::error::{CommError, Result};

/// Messenger for devices that publish their state as a file on an HTTP server.
///
/// Sending is a no-op; the first receive after a send fetches the file. A second
/// receive within the same round trip reports end of stream.
#[derive(Debug)]
pub struct HttpMessenger {
    url: Url,
    timeout: Duration,
    client: Option<Client>,
    fetched: bool,
}

impl HttpMessenger {
    /// Create a messenger for the file at `url`.
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            timeout,
            client: None,
            fetched: false,
        }
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_none() {
            let client = Client::builder().timeout(self.timeout).build()?;
            self.client = Some(client);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn send(&mut self, _ctl: &ControllerInfo, _frame: &[u8]) -> Result<()> {
        if self.client.is_none() {
            return Err(CommError::Disconnected);
        }
        self.fetched = false;
        Ok(())
    }

    async fn recv(&mut self, _ctl: &ControllerInfo, buf: &mut BytesMut) -> Result<usize> {
        let client = self.client.as_ref().ok_or(CommError::Disconnected)?;
        if self.fetched {
            return Err(CommError::Disconnected);
        }
        self.fetched = true;
        let body = client
            .get(self.url.clone())
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|err| match CommError::from(err) {
                CommError::Timeout(_) => CommError::Timeout(self.timeout),
                other => other,
            })?
            .bytes()
            .await?;
        buf.extend_from_slice(&body);
        Ok(body.len())
    }

    async fn drain(&mut self) -> Result<()> {
        self.fetched = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.client = None;
    }
}
