//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Bundled drivers polled end to end against their simulators."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use iris_comm::prelude::*;
use iris_comm::{
    AddOutcome, ControllerRegistry, FaultClass, LinkConfig, LinkHandle, MessengerFactory,
    PollCycle, Poller, Responder, RetryPolicy,
};
use iris_drivers::{GpsDriver, GpsSim, RelayDriver, RelaySim, WeatherDriver, WeatherSim};

async fn until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn spawn(
    link: &str,
    sim: Arc<dyn Responder>,
    driver: Arc<dyn Driver>,
    controllers: &[(&str, u16)],
) -> (Poller, Vec<ControllerId>) {
    let registry = ControllerRegistry::new();
    let ids = controllers
        .iter()
        .map(|(name, drop)| registry.insert(ControllerInfo::new(*name, link, *drop)))
        .collect();
    let factory = MessengerFactory::new();
    factory.register_responder("sim", sim);
    let config = LinkConfig::new(link, "mem://sim", driver.protocol())
        .with_retry(RetryPolicy::immediate(2))
        .with_timeout(Duration::from_millis(100));
    let poller = Poller::builder(config, driver)
        .registry(registry)
        .factory(factory)
        .spawn()
        .expect("poller spawns");
    (poller, ids)
}

fn successes(link: &LinkHandle, id: ControllerId) -> u64 {
    link.registry().status(id).map_or(0, |status| status.success_count)
}

fn failures(link: &LinkHandle, id: ControllerId) -> u64 {
    link.registry().status(id).map_or(0, |status| status.failure_count)
}

struct Relays {
    poller: Poller,
    link: LinkHandle,
    sim: Arc<RelaySim>,
    driver: Arc<RelayDriver>,
    ids: Vec<ControllerId>,
}

fn relays(sim: RelaySim) -> Relays {
    let sim = Arc::new(sim);
    let driver = Arc::new(RelayDriver::new());
    let (poller, ids) = spawn(
        "relays-1",
        sim.clone(),
        driver.clone(),
        &[("relay-1", 1), ("relay-2", 2)],
    );
    let link = poller.handle();
    Relays {
        poller,
        link,
        sim,
        driver,
        ids,
    }
}

#[tokio::test(start_paused = true)]
async fn relay_status_poll_updates_board_and_maint_status() {
    let r = relays(RelaySim::new(5).with_board(1, 8, true).with_board(2, 4, false));
    let (one, two) = (r.ids[0], r.ids[1]);
    assert_eq!(
        r.link.send_request(one, DeviceRequest::QueryStatus),
        Some(AddOutcome::Queued)
    );
    r.link.send_request(two, DeviceRequest::QueryStatus);
    until("both polls", || successes(&r.link, one) == 1 && successes(&r.link, two) == 1).await;

    let status = r.link.registry().status(one).unwrap();
    assert_eq!(status.maint_status, "relays=0000");
    assert!(r.driver.board().get(one).unwrap().temperature.is_some());
    assert!(r.driver.board().get(two).unwrap().temperature.is_none());
    r.poller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn relay_command_is_verified_then_rechecked() {
    let r = relays(RelaySim::new(5).with_board(1, 8, false));
    let one = r.ids[0];
    let target = r.link.target(one).unwrap();
    r.link.submit(r.driver.set_relay(&target, 3, true).unwrap());
    until("relay command", || successes(&r.link, one) == 1).await;

    assert_eq!(r.sim.relays(1), Some(0x0008));
    assert_eq!(r.driver.board().get(one).unwrap().relays, 0x0008);
    assert_eq!(r.link.pending_future_ops(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    until("follow-up status poll", || successes(&r.link, one) == 2).await;
    assert_eq!(
        r.link.registry().status(one).unwrap().maint_status,
        "relays=0008"
    );
    r.poller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stuck_relay_fails_without_retry() {
    let r = relays(RelaySim::new(5).with_board(1, 8, false).stuck_relay(1, 2));
    let one = r.ids[0];
    let target = r.link.target(one).unwrap();
    r.link.submit(r.driver.set_relay(&target, 2, true).unwrap());
    until("relay failure", || failures(&r.link, one) == 1).await;

    let status = r.link.registry().status(one).unwrap();
    assert!(status.error_status.contains("relay 2 did not latch"));
    assert_eq!(status.faults(FaultClass::Protocol), 1);
    assert_eq!(r.link.pending_future_ops(), 0);
    r.poller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unconfigured_board_gets_its_settings() {
    let r = relays(RelaySim::new(5).with_board(1, 8, false).unconfigured(1));
    let one = r.ids[0];
    r.link.send_request(one, DeviceRequest::QueryStatus);
    until("settings download", || r.sim.is_configured(1)).await;
    until("status after download", || successes(&r.link, one) == 2).await;
    assert_eq!(failures(&r.link, one), 0);
    assert!(r.driver.board().get(one).and_then(|state| state.updated).is_some());
    r.poller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reset_rereads_identity_after_settling() {
    let r = relays(RelaySim::new(5).with_board(1, 8, true));
    let one = r.ids[0];
    r.link.send_request(one, DeviceRequest::ResetDevice);
    until("reset", || successes(&r.link, one) == 1).await;
    assert!(r.link.registry().setup(one).is_none());

    tokio::time::sleep(Duration::from_secs(6)).await;
    until("identity query", || successes(&r.link, one) == 2).await;
    let setup = r.link.registry().setup(one).unwrap();
    assert_eq!(setup.serial.as_deref(), Some("R001"));
    assert_eq!(setup.capability_u64("relays"), Some(8));
    assert_eq!(setup.capabilities.get("temperature"), Some(&serde_json::Value::Bool(true)));
    r.poller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sampling_cycle_completes_and_rejects_skewed_stamps() {
    let r = relays(RelaySim::new(5).with_board(1, 8, false).with_board(2, 8, false));
    let cycle = PollCycle::new("30-sec");
    let completer = cycle
        .run(Utc::now(), |completer| {
            for id in &r.ids {
                let target = r.link.target(*id).unwrap();
                r.link.submit(r.driver.query_samples(&target, completer.clone()));
            }
        })
        .unwrap();
    assert!(completer.wait(Duration::from_secs(5)).await);
    for id in &r.ids {
        assert!(r.driver.board().get(*id).unwrap().count.is_some());
    }

    r.sim.set_clock_skew(chrono::Duration::hours(-6));
    let two = r.ids[1];
    let completer = cycle
        .run(Utc::now(), |completer| {
            let target = r.link.target(two).unwrap();
            r.link.submit(r.driver.query_samples(&target, completer.clone()));
        })
        .unwrap();
    assert!(completer.wait(Duration::from_secs(5)).await);
    let status = r.link.registry().status(two).unwrap();
    assert_eq!(status.failure_count, 1);
    assert_eq!(status.faults(FaultClass::Protocol), 1);
    assert_eq!(status.faults(FaultClass::Decode), 0);
    assert!(status.error_status.starts_with("controller error: sample stamp"));
    r.poller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn gps_lock_and_loss_are_reported() {
    let sim = Arc::new(GpsSim::new(9, 0.0).with_modem("gps-1", 44.9778, -93.2650));
    let driver = Arc::new(GpsDriver::new());
    let (poller, ids) = spawn("modems", sim.clone(), driver.clone(), &[("gps-1", 1)]);
    let link = poller.handle();
    let id = ids[0];

    link.send_request(id, DeviceRequest::QueryGpsLocation);
    until("locked poll", || successes(&link, id) == 1).await;
    let location = driver.board().get(id).unwrap();
    assert!(location.fix.lock);
    assert!((location.fix.lat - 44.9778).abs() < 1e-4);
    assert_eq!(link.registry().status(id).unwrap().maint_status, "gps lock");

    sim.set_lock("gps-1", false);
    link.send_request(id, DeviceRequest::QueryGpsLocation);
    until("unlocked poll", || successes(&link, id) == 2).await;
    assert_eq!(link.registry().status(id).unwrap().maint_status, "no gps lock");

    sim.set_corrupt("gps-1", true);
    link.send_request(id, DeviceRequest::QueryGpsLocation);
    until("corrupt poll", || failures(&link, id) == 1).await;
    assert_eq!(
        link.registry().status(id).unwrap().faults(FaultClass::Decode),
        3
    );
    poller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn weather_feed_faults_are_classified() {
    let sim = Arc::new(WeatherSim::new(2).with_station("rwis-1"));
    let driver = Arc::new(WeatherDriver::new());
    let (poller, ids) = spawn("wx-feed", sim.clone(), driver.clone(), &[("rwis-1", 1)]);
    let link = poller.handle();
    let id = ids[0];

    link.send_request(id, DeviceRequest::QueryStatus);
    until("feed poll", || successes(&link, id) == 1).await;
    assert_eq!(driver.board().get(id).unwrap().station, "rwis-1");

    sim.set_garbled(true);
    link.send_request(id, DeviceRequest::QueryStatus);
    until("garbled poll", || failures(&link, id) == 1).await;
    assert_eq!(
        link.registry().status(id).unwrap().faults(FaultClass::Decode),
        3
    );

    sim.set_garbled(false);
    sim.set_truncated(true);
    link.send_request(id, DeviceRequest::QueryStatus);
    until("truncated poll", || failures(&link, id) == 2).await;
    let status = link.registry().status(id).unwrap();
    assert_eq!(status.faults(FaultClass::Transport), 3);
    assert!(status.error_status.starts_with("poll timeout"));
    poller.shutdown().await;
}
