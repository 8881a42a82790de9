//! ---
//! iris_section: "01-core-functionality"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Starts one poller per configured link and fans requests out to them."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use iris_comm::{
    Completer, ControllerInfo, ControllerRegistry, ControllerStatus, DeviceRequest, LinkHandle,
    MessengerFactory, PollCycle, Poller, PollerMetrics, PollerState,
};
use iris_drivers::{DriverError, DriverSet, Protocol};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DaemonConfig;

#[derive(Clone)]
struct ManagedLink {
    handle: LinkHandle,
    protocol: Protocol,
}

/// Handles of every running link.
#[derive(Clone)]
pub struct LinkSet {
    registry: ControllerRegistry,
    drivers: DriverSet,
    links: Vec<ManagedLink>,
}

/// Owns the comm tasks started for a configuration.
pub struct Supervisor {
    links: LinkSet,
    pollers: Vec<Poller>,
}

/// Status of one link for the run report.
#[derive(Debug, Serialize)]
pub struct LinkReport {
    /// Link name.
    pub name: String,
    /// Driver protocol.
    pub protocol: String,
    /// Comm task state.
    pub state: PollerState,
    /// `OPEN`, `CLOSED` or the last connect failure.
    pub status: String,
    /// Line load of the last sample interval.
    pub load: f32,
    /// Operations still queued.
    pub queued: usize,
    /// Controllers on the link.
    pub controllers: Vec<ControllerReport>,
}

/// Status of one controller for the run report.
#[derive(Debug, Serialize)]
pub struct ControllerReport {
    /// Controller name.
    pub name: String,
    /// Drop address.
    pub drop: u16,
    /// Comm counters and status strings.
    pub status: ControllerStatus,
}

impl Supervisor {
    /// Register controllers and spawn a poller per link.
    pub fn start(
        config: &DaemonConfig,
        factory: MessengerFactory,
        metrics: Option<PollerMetrics>,
    ) -> Result<Self> {
        let registry = ControllerRegistry::new();
        for controller in &config.comm.controllers {
            registry.insert(ControllerInfo::from(controller));
        }
        let drivers = DriverSet::new();
        let mut links = Vec::with_capacity(config.comm.links.len());
        let mut pollers = Vec::with_capacity(config.comm.links.len());
        for (index, link) in config.comm.links.iter().enumerate() {
            let protocol: Protocol = link
                .protocol
                .parse()
                .map_err(|_| DriverError::UnknownProtocol(link.protocol.clone()))
                .with_context(|| format!("link '{}'", link.name))?;
            let mut builder = Poller::builder(link.clone(), drivers.driver(protocol))
                .registry(registry.clone())
                .factory(factory.clone())
                .seed(config.simulation.seed.wrapping_add(index as u64));
            if let Some(metrics) = &metrics {
                builder = builder.metrics(metrics.clone());
            }
            let poller = builder
                .spawn()
                .with_context(|| format!("failed to start link '{}'", link.name))?;
            links.push(ManagedLink {
                handle: poller.handle(),
                protocol,
            });
            pollers.push(poller);
        }
        info!(
            links = links.len(),
            controllers = registry.len(),
            "comm links started"
        );
        Ok(Self {
            links: LinkSet {
                registry,
                drivers,
                links,
            },
            pollers,
        })
    }

    /// Shareable handles for the periodic jobs.
    pub fn links(&self) -> LinkSet {
        self.links.clone()
    }

    /// Stop every comm task, cancelling queued work.
    pub async fn shutdown(self) {
        join_all(self.pollers.into_iter().map(Poller::shutdown)).await;
        info!("comm links stopped");
    }
}

impl LinkSet {
    /// Send a request to every controller of every link. Returns how many were queued.
    pub fn request_all(&self, request: DeviceRequest) -> usize {
        let mut queued = 0;
        for link in &self.links {
            for id in self.registry.ids_on_link(link.handle.name()) {
                if link.handle.send_request(id, request).is_some() {
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Start a sample cycle over every controller whose protocol collects samples.
    ///
    /// Returns `None` when the previous cycle is still outstanding.
    pub fn run_sample_cycle(
        &self,
        cycle: &PollCycle,
        stamp: DateTime<Utc>,
    ) -> Option<Arc<Completer>> {
        cycle.run(stamp, |completer| {
            for link in &self.links {
                for id in self.registry.ids_on_link(link.handle.name()) {
                    let Some(target) = link.handle.target(id) else {
                        continue;
                    };
                    if let Some(op) =
                        self.drivers
                            .query_samples(link.protocol, &target, completer.clone())
                    {
                        link.handle.submit(op);
                    }
                }
            }
        })
    }

    /// Snapshot of every link and controller.
    pub fn report(&self) -> Vec<LinkReport> {
        self.links
            .iter()
            .map(|link| {
                let controllers = self
                    .registry
                    .ids_on_link(link.handle.name())
                    .into_iter()
                    .filter_map(|id| {
                        let info = self.registry.info(id)?;
                        let status = self.registry.status(id)?;
                        Some(ControllerReport {
                            name: info.name.clone(),
                            drop: info.drop,
                            status,
                        })
                    })
                    .collect();
                LinkReport {
                    name: link.handle.name().to_owned(),
                    protocol: link.protocol.to_string(),
                    state: link.handle.state(),
                    status: link.handle.status(),
                    load: link.handle.load(),
                    queued: link.handle.queue_len(),
                    controllers,
                }
            })
            .collect()
    }

    /// Log one line per link.
    pub fn log_summary(&self) {
        for report in self.report() {
            let failing = report
                .controllers
                .iter()
                .filter(|ctl| !ctl.status.error_status.is_empty())
                .count();
            if failing > 0 {
                warn!(
                    link = %report.name,
                    status = %report.status,
                    failing,
                    "link has failing controllers"
                );
            } else {
                info!(
                    link = %report.name,
                    status = %report.status,
                    load = report.load,
                    queued = report.queued,
                    "link healthy"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LAYOUT: &str = r#"
        [[links]]
        name = "relays-1"
        uri = "mem://relay-line"
        protocol = "relay"
        timeout = 100

        [[links]]
        name = "modems"
        uri = "mem://modems"
        protocol = "gps"
        timeout = 100

        [[controllers]]
        name = "relay-1"
        link = "relays-1"
        drop = 1

        [[controllers]]
        name = "relay-2"
        link = "relays-1"
        drop = 2

        [[controllers]]
        name = "gps-1"
        link = "modems"
        drop = 1

        [simulation]
        seed = 7

        [[simulation.relay]]
        name = "relay-line"
        boards = [{ drop = 1 }, { drop = 2, sensor = true }]

        [[simulation.gps]]
        name = "modems"
        modems = [{ name = "gps-1", lat = 44.95, lon = -93.1 }]
    "#;

    fn start() -> Supervisor {
        let config: DaemonConfig = LAYOUT.parse().unwrap();
        let factory = MessengerFactory::new();
        config.simulation.build().register(&factory);
        Supervisor::start(&config, factory, None).unwrap()
    }

    async fn settle(links: &LinkSet, done: impl Fn(&[LinkReport]) -> bool) {
        for _ in 0..500 {
            if done(&links.report()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("links did not settle: {:?}", links.report());
    }

    fn all_succeeded(reports: &[LinkReport], count: u64) -> bool {
        reports
            .iter()
            .flat_map(|link| &link.controllers)
            .all(|ctl| ctl.status.success_count >= count)
    }

    #[tokio::test(start_paused = true)]
    async fn status_requests_reach_every_controller() {
        let supervisor = start();
        let links = supervisor.links();
        assert_eq!(links.request_all(DeviceRequest::QueryStatus), 3);
        settle(&links, |reports| all_succeeded(reports, 1)).await;

        let report = links.report();
        assert_eq!(report[0].protocol, "relay");
        assert_eq!(report[0].status, "OPEN");
        assert_eq!(report[1].controllers[0].status.maint_status, "gps lock");
        supervisor.shutdown().await;
        assert!(links
            .report()
            .iter()
            .all(|link| link.state == PollerState::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn sample_cycle_skips_protocols_without_samples() {
        let supervisor = start();
        let links = supervisor.links();
        let cycle = PollCycle::new("sample");
        let completer = links.run_sample_cycle(&cycle, Utc::now()).unwrap();
        assert!(completer.wait(Duration::from_secs(5)).await);
        let report = links.report();
        assert!(report[0]
            .controllers
            .iter()
            .all(|ctl| ctl.status.success_count == 1));
        assert_eq!(report[1].controllers[0].status.success_count, 0);
        supervisor.shutdown().await;
    }

    #[test]
    fn unknown_protocol_fails_startup() {
        let layout = LAYOUT.replace("protocol = \"gps\"", "protocol = \"ntcip\"");
        let config: DaemonConfig = layout.parse().unwrap();
        let factory = MessengerFactory::new();
        config.simulation.build().register(&factory);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = runtime
            .block_on(async { Supervisor::start(&config, factory, None).err() })
            .unwrap();
        assert!(format!("{err:#}").contains("unknown protocol 'ntcip'"));
    }
}
