//! ---
//! iris_section: "01-core-functionality"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Periodic status and sample polling jobs."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::Utc;
use iris_comm::{DeviceRequest, PollCycle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::links::LinkSet;

async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Spawn the periodic jobs; they exit once `shutdown` turns true.
pub fn spawn_jobs(
    links: LinkSet,
    polling: &PollingConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    if polling.query_setup {
        let queued = links.request_all(DeviceRequest::QueryConfiguration);
        info!(queued, "configuration queries dispatched");
    }
    vec![
        tokio::spawn(status_job(
            links.clone(),
            polling.status_interval,
            shutdown.clone(),
        )),
        tokio::spawn(sample_job(links, polling.sample_interval, shutdown)),
    ]
}

async fn status_job(links: LinkSet, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let queued = links.request_all(DeviceRequest::QueryStatus);
                debug!(queued, "status polls dispatched");
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
}

async fn sample_job(links: LinkSet, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let cycle = PollCycle::new("sample");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(completer) = links.run_sample_cycle(&cycle, Utc::now()) else {
                    continue;
                };
                tokio::spawn(async move {
                    if completer.wait(period).await {
                        debug!(stamp = %completer.stamp(), "sample cycle complete");
                    } else {
                        warn!(
                            stamp = %completer.stamp(),
                            pending = completer.pending(),
                            "sample cycle still outstanding at next interval"
                        );
                    }
                });
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::links::Supervisor;
    use iris_comm::MessengerFactory;

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

        [polling]
        status_interval = 10
        sample_interval = 30

        [[simulation.relay]]
        name = "relay-line"
        boards = [{ drop = 1, sensor = true }]
    "#;

    #[tokio::test(start_paused = true)]
    async fn jobs_poll_until_shutdown() {
        let config: DaemonConfig = LAYOUT.parse().unwrap();
        let factory = MessengerFactory::new();
        config.simulation.build().register(&factory);
        let supervisor = Supervisor::start(&config, factory, None).unwrap();
        let links = supervisor.links();
        let (tx, rx) = watch::channel(false);
        let jobs = spawn_jobs(links.clone(), &config.polling, rx);

        tokio::time::sleep(Duration::from_secs(25)).await;
        let report = links.report();
        let status = &report[0].controllers[0].status;
        // setup query, status polls at 0s, 10s and 20s, one sample at 0s
        assert_eq!(status.success_count, 5);
        assert_eq!(status.setup.as_ref().and_then(|s| s.serial.as_deref()), Some("R001"));

        tx.send(true).unwrap();
        for job in jobs {
            job.await.unwrap();
        }
        supervisor.shutdown().await;
    }
}
