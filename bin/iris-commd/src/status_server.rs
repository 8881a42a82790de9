//! ---
//! iris_section: "03-persistence-logging"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "HTTP endpoint for engine metrics and live link status."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
//! Routes:
//!
//! - `GET /metrics`: Prometheus text exposition of the comm engine families.
//! - `GET /links`: JSON array of [`LinkReport`] for every running link.
//! - `GET /links/:name`: JSON report of one link, `404` when unknown.
use std::net::{SocketAddr, TcpListener as StdTcpListener};

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use iris_comm::SharedRegistry;
use prometheus::TextEncoder;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::links::{LinkReport, LinkSet};

#[derive(Clone)]
struct StatusState {
    registry: SharedRegistry,
    links: LinkSet,
}

/// Serve metrics and link status on `addr` until [`StatusServer::shutdown`].
pub fn spawn_status_server(
    registry: SharedRegistry,
    links: LinkSet,
    addr: SocketAddr,
) -> Result<StatusServer> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/links", get(all_links))
        .route("/links/:name", get(one_link))
        .with_state(StatusState { registry, links });

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind status listener {addr}"))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure status listener as non-blocking")?;
    let bound = std_listener.local_addr()?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %bound, "status server listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("status server stopped with an error")?;
        Ok(())
    });

    Ok(StatusServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn metrics(State(state): State<StatusState>) -> Response {
    match TextEncoder::new().encode_to_string(&state.registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT))],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

async fn all_links(State(state): State<StatusState>) -> Response {
    json(&state.links.report())
}

async fn one_link(State(state): State<StatusState>, Path(name): Path<String>) -> Response {
    let report: Option<LinkReport> = state
        .links
        .report()
        .into_iter()
        .find(|link| link.name == name);
    match report {
        Some(report) => json(&report),
        None => {
            debug!(link = %name, "status requested for unknown link");
            (StatusCode::NOT_FOUND, format!("no link named '{name}'")).into_response()
        }
    }
}

fn json(value: &impl Serialize) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to serialize link status");
            (StatusCode::INTERNAL_SERVER_ERROR, "status encoding error").into_response()
        }
    }
}

/// Running status endpoint.
pub struct StatusServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl StatusServer {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving and wait for in-flight requests.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(anyhow::Error::new)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::links::Supervisor;
    use iris_comm::{new_registry, DeviceRequest, MessengerFactory, PollerMetrics};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LAYOUT: &str = r#"
        [[links]]
        name = "relays-1"
        uri = "mem://relay-line"
        protocol = "relay"
        timeout = 100

        [[controllers]]
        name = "relay-1"
        link = "relays-1"
        drop = 1

        [[simulation.relay]]
        name = "relay-line"
        boards = [{ drop = 1 }]
    "#;

    async fn get(addr: SocketAddr, path: &str) -> (String, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        (head.to_owned(), body.to_owned())
    }

    #[tokio::test]
    async fn serves_metrics_and_link_status() {
        let config: DaemonConfig = LAYOUT.parse().unwrap();
        let factory = MessengerFactory::new();
        config.simulation.build().register(&factory);
        let registry = new_registry();
        let metrics = PollerMetrics::new(registry.clone()).unwrap();
        let supervisor = Supervisor::start(&config, factory, Some(metrics)).unwrap();
        let links = supervisor.links();
        assert_eq!(links.request_all(DeviceRequest::QueryStatus), 1);
        for _ in 0..500 {
            if links.report()[0].controllers[0].status.success_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let server =
            spawn_status_server(registry, links, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        let (head, body) = get(server.addr(), "/metrics").await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(body.contains("iris_comm_operations_total"));

        let (head, body) = get(server.addr(), "/links").await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.contains("application/json"));
        let reports: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(reports[0]["name"], "relays-1");
        assert_eq!(reports[0]["status"], "OPEN");
        assert_eq!(reports[0]["controllers"][0]["name"], "relay-1");
        assert_eq!(reports[0]["controllers"][0]["status"]["success_count"], 1);

        let (head, body) = get(server.addr(), "/links/relays-1").await;
        assert!(head.starts_with("HTTP/1.1 200"));
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["protocol"], "relay");

        let (head, _) = get(server.addr(), "/links/nowhere").await;
        assert!(head.starts_with("HTTP/1.1 404"));

        server.shutdown().await.unwrap();
        supervisor.shutdown().await;
    }
}
