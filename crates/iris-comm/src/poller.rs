//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Per-link comm task draining the operation queue."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use strum::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::controller::{ControllerId, ControllerInfo, ControllerRegistry};
use crate::driver::{DeviceRequest, DispatchTarget, Driver};
use crate::error::{CommError, Result};
use crate::future::FutureOps;
use crate::log::{LogLevel, NoopCommLog, SharedCommLog, TracingCommLog};
use crate::message::CommMessage;
use crate::messenger::{Messenger, MessengerFactory};
use crate::metrics::PollerMetrics;
use crate::operation::{Cleanup, QueuedOp};
use crate::priority::PriorityLevel;
use crate::queue::{AddOutcome, OpQueue, QueuedSummary, Ticket};

const STATUS_OPEN: &str = "OPEN";
const STATUS_CLOSED: &str = "CLOSED";

/// Observable state of a comm task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PollerState {
    /// Waiting for work.
    Idle,
    /// Opening the messenger.
    Connecting,
    /// Exchanging one phase with a controller.
    RunningPhase,
    /// Backing off before a retry.
    RetryWait,
    /// Shut down; no further work is accepted.
    Terminated,
}

/// Fraction of wall time a link spends polling, sampled over fixed intervals.
#[derive(Debug, Clone)]
pub struct LoadSampler {
    interval: Duration,
    window_start: Instant,
    busy: Duration,
    load: f32,
}

impl LoadSampler {
    /// Sampler starting its first interval now.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            busy: Duration::ZERO,
            load: 0.0,
        }
    }

    /// Add busy time and close the interval if it has elapsed.
    pub fn record(&mut self, busy: Duration) -> Option<f32> {
        self.busy += busy;
        self.roll(Instant::now())
    }

    /// Close the interval if it has elapsed at `now`, returning the new sample.
    pub fn roll(&mut self, now: Instant) -> Option<f32> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }
        self.load = (self.busy.as_secs_f64() / elapsed.as_secs_f64()).min(1.0) as f32;
        self.busy = Duration::ZERO;
        self.window_start = now;
        Some(self.load)
    }

    /// Latest completed sample.
    pub fn load(&self) -> f32 {
        self.load
    }
}

struct LinkShared {
    name: String,
    queue: Arc<OpQueue>,
    future: FutureOps,
    registry: ControllerRegistry,
    driver: Arc<dyn Driver>,
    state: Mutex<PollerState>,
    status: Mutex<String>,
    load: Mutex<LoadSampler>,
    shutdown: watch::Sender<bool>,
    metrics: Option<PollerMetrics>,
}

/// Cloneable handle to a running link.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<LinkShared>,
}

impl LinkHandle {
    /// Link name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Controller registry the link reports into.
    pub fn registry(&self) -> &ControllerRegistry {
        &self.shared.registry
    }

    /// Submit an operation for execution.
    pub fn submit(&self, op: impl Into<QueuedOp>) -> AddOutcome {
        let op = op.into();
        let (id, name, controller, priority) = (op.id(), op.name(), op.controller(), op.priority());
        let outcome = self.shared.queue.add(op);
        match outcome {
            AddOutcome::Queued => debug!(
                link = %self.shared.name,
                op = %id,
                name,
                controller = %controller,
                priority = %priority,
                "operation queued"
            ),
            AddOutcome::Duplicate => trace!(
                link = %self.shared.name,
                name,
                controller = %controller,
                "equal operation already pending"
            ),
            AddOutcome::Closed => debug!(
                link = %self.shared.name,
                name,
                "link closed, operation dropped"
            ),
        }
        self.publish_depth();
        outcome
    }

    /// Submit an operation once `delay` has elapsed.
    pub fn queue_op(&self, delay: Duration, op: impl Into<QueuedOp>) {
        if self.is_shutdown() {
            return;
        }
        self.shared.future.schedule(delay, op.into());
    }

    /// Dispatch a device request at its default priority.
    pub fn send_request(
        &self,
        controller: ControllerId,
        request: DeviceRequest,
    ) -> Option<AddOutcome> {
        self.send_request_at(controller, request, request.default_priority())
    }

    /// Dispatch a device request through the driver at `priority`.
    ///
    /// Returns `None` when the driver does not handle the request or the controller is
    /// not on this link.
    pub fn send_request_at(
        &self,
        controller: ControllerId,
        request: DeviceRequest,
        priority: PriorityLevel,
    ) -> Option<AddOutcome> {
        let target = self.target(controller)?;
        match self.shared.driver.dispatch(&target, request, priority) {
            Some(op) => Some(self.submit(op)),
            None => {
                debug!(
                    link = %self.shared.name,
                    controller = %target.info.name,
                    request = %request,
                    protocol = self.shared.driver.protocol(),
                    "request not handled by driver"
                );
                None
            }
        }
    }

    /// Dispatch target for a controller served by this link.
    pub fn target(&self, controller: ControllerId) -> Option<DispatchTarget> {
        let Some(info) = self.shared.registry.info(controller) else {
            warn!(
                link = %self.shared.name,
                controller = %controller,
                "request for unknown controller"
            );
            return None;
        };
        if info.link != self.shared.name {
            warn!(
                link = %self.shared.name,
                controller = %info.name,
                owner = %info.link,
                "request for controller on another link"
            );
            return None;
        }
        Some(DispatchTarget {
            id: controller,
            setup: self.shared.registry.setup(controller),
            info,
        })
    }

    /// Current comm task state.
    pub fn state(&self) -> PollerState {
        *self.shared.state.lock()
    }

    /// Link status string (`OPEN`, `CLOSED` or the last transport fault).
    pub fn status(&self) -> String {
        self.shared.status.lock().clone()
    }

    /// Latest line load sample.
    pub fn load(&self) -> f32 {
        self.shared.load.lock().load()
    }

    /// Operations waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Queued operations in service order.
    pub fn snapshot(&self) -> Vec<QueuedSummary> {
        self.shared.queue.snapshot()
    }

    /// Future operations not yet due.
    pub fn pending_future_ops(&self) -> usize {
        self.shared.future.pending()
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Request shutdown; the comm task cancels remaining work and terminates.
    pub fn shutdown(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        info!(link = %self.shared.name, "link shutdown requested");
        self.shared.queue.close();
        self.shared.future.cancel_all();
    }

    fn publish_depth(&self) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_queue_depth(&self.shared.name, self.shared.queue.len());
        }
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder wiring a link's messenger, driver and observability.
pub struct PollerBuilder {
    config: LinkConfig,
    driver: Arc<dyn Driver>,
    registry: ControllerRegistry,
    factory: MessengerFactory,
    messenger: Option<Box<dyn Messenger>>,
    log: Option<SharedCommLog>,
    metrics: Option<PollerMetrics>,
    seed: u64,
}

impl PollerBuilder {
    /// Builder for `config` served by `driver`.
    pub fn new(config: LinkConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            config,
            driver,
            registry: ControllerRegistry::new(),
            factory: MessengerFactory::new(),
            messenger: None,
            log: None,
            metrics: None,
            seed: 0x1815_u64,
        }
    }

    /// Registry holding the link's controllers.
    pub fn registry(mut self, registry: ControllerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Factory resolving the link URI.
    pub fn factory(mut self, factory: MessengerFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Use `messenger` instead of resolving the link URI.
    pub fn messenger(mut self, messenger: Box<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// Protocol log sink.
    pub fn log(mut self, log: SharedCommLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Metrics handle.
    pub fn metrics(mut self, metrics: PollerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Seed for backoff jitter.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Start the comm task on the current tokio runtime.
    pub fn spawn(self) -> Result<Poller> {
        self.config.validate()?;
        let messenger = match self.messenger {
            Some(messenger) => messenger,
            None => self
                .factory
                .create(&self.config, self.driver.default_scheme())?,
        };
        let log: SharedCommLog = match self.log {
            Some(log) => log,
            None if self.config.log_protocol => {
                Arc::new(TracingCommLog::new(self.driver.protocol()))
            }
            None => Arc::new(NoopCommLog),
        };
        let queue = Arc::new(OpQueue::new(self.config.name.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            name: self.config.name.clone(),
            future: FutureOps::new(&queue),
            queue,
            registry: self.registry,
            driver: self.driver,
            state: Mutex::new(PollerState::Idle),
            status: Mutex::new(STATUS_CLOSED.to_owned()),
            load: Mutex::new(LoadSampler::new(self.config.load_interval)),
            shutdown: shutdown_tx,
            metrics: self.metrics,
        });
        let link = LinkHandle { shared };
        info!(
            link = %self.config.name,
            uri = %self.config.uri,
            protocol = link.shared.driver.protocol(),
            transport = messenger.kind(),
            "poller started"
        );
        let task = CommTask {
            link: link.clone(),
            config: self.config,
            messenger,
            log,
            rng: StdRng::seed_from_u64(self.seed),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        Ok(Poller {
            link,
            task: Some(handle),
        })
    }
}

/// A running comm link: its handle plus the comm task.
pub struct Poller {
    link: LinkHandle,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    /// Builder for a new poller.
    pub fn builder(config: LinkConfig, driver: Arc<dyn Driver>) -> PollerBuilder {
        PollerBuilder::new(config, driver)
    }

    /// Handle for submitting work and reading status.
    pub fn handle(&self) -> LinkHandle {
        self.link.clone()
    }

    /// Shut down and wait for the comm task to drain.
    pub async fn shutdown(mut self) {
        self.link.shutdown();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(link = %self.link.name(), error = %err, "comm task ended abnormally");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.link.shutdown();
        }
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct CommTask {
    link: LinkHandle,
    config: LinkConfig,
    messenger: Box<dyn Messenger>,
    log: SharedCommLog,
    rng: StdRng,
    shutdown: watch::Receiver<bool>,
}

impl CommTask {
    async fn run(mut self) {
        let queue = self.link.shared.queue.clone();
        loop {
            self.set_state(PollerState::Idle);
            let idle_limit = self
                .config
                .idle_disconnect
                .filter(|_| self.messenger.is_connected());
            let next = match idle_limit {
                Some(limit) => tokio::select! {
                    ticket = queue.next() => Some(ticket),
                    _ = sleep(limit) => None,
                },
                None => Some(queue.next().await),
            };
            match next {
                Some(Some(ticket)) => self.service(ticket).await,
                Some(None) => break,
                None => {
                    debug!(link = %self.config.name, "idle timeout, closing transport");
                    self.disconnect(STATUS_CLOSED).await;
                }
            }
        }
        self.terminate().await;
    }

    async fn service(&mut self, mut ticket: Ticket) {
        let controller = ticket.op.controller();
        let Some(info) = self.link.registry().info(controller) else {
            ticket
                .op
                .inner
                .fail(format!("unknown controller {controller}"));
            self.cleanup(ticket.op);
            return;
        };
        if !self.link.shared.driver.is_address_valid(info.drop) {
            let err = CommError::InvalidAddress(format!("drop {} of {}", info.drop, info.name));
            self.record_fault(&mut ticket.op, &info, &err);
            ticket.op.inner.fail(err.to_string());
            self.cleanup(ticket.op);
            return;
        }
        self.link
            .registry()
            .set_active_op(controller, Some(ticket.op.id()));

        if !self.messenger.is_connected() {
            if let Err(err) = self.connect().await {
                self.record_fault(&mut ticket.op, &info, &err);
                ticket.op.inner.fail(err.to_string());
                self.cleanup(ticket.op);
                return;
            }
        }

        self.set_state(PollerState::RunningPhase);
        let started = Instant::now();
        let outcome = {
            let mut mess = CommMessage::new(&mut *self.messenger, &info, &*self.log);
            tokio::select! {
                result = ticket.op.inner.step(&mut mess) => Some(result),
                _ = wait_shutdown(&mut self.shutdown) => None,
            }
        };
        self.record_busy(started.elapsed());

        match outcome {
            Some(Ok(())) if ticket.op.is_done() => self.cleanup(ticket.op),
            Some(Ok(())) => self.requeue(ticket),
            Some(Err(err)) => self.handle_fault(ticket, &info, err).await,
            None => {
                ticket
                    .op
                    .inner
                    .fail(CommError::Cancelled("link shut down".into()).to_string());
                self.cleanup(ticket.op);
            }
        }
    }

    async fn handle_fault(&mut self, mut ticket: Ticket, info: &ControllerInfo, err: CommError) {
        self.record_fault(&mut ticket.op, info, &err);
        if err.closes_transport() {
            self.disconnect(&err.to_string()).await;
        } else if err.drains_input() {
            if let Err(drain_err) = self.messenger.drain().await {
                warn!(link = %self.config.name, error = %drain_err, "drain failed");
                self.disconnect(&drain_err.to_string()).await;
            }
        }
        let first_request = matches!(err, CommError::SettingsRequested)
            && ticket.op.inner.mark_settings_requested();
        if first_request && self.request_settings(ticket.op.controller(), ticket.op.priority()) {
            let returned = self.link.shared.queue.defer(ticket);
            self.returned(returned);
            return;
        }

        if self.config.retry.is_retryable(&err) {
            let attempt = ticket.op.inner.record_attempt();
            if attempt <= self.config.retry.max_retries {
                if let Some(metrics) = &self.link.shared.metrics {
                    metrics.record_retry(&self.config.name);
                }
                let delay = self.config.retry.backoff_delay(attempt, &mut self.rng);
                debug!(
                    link = %self.config.name,
                    controller = %info.name,
                    op = ticket.op.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                if !delay.is_zero() {
                    self.set_state(PollerState::RetryWait);
                    let cancelled = tokio::select! {
                        _ = sleep(delay) => false,
                        _ = wait_shutdown(&mut self.shutdown) => true,
                    };
                    if cancelled {
                        ticket
                            .op
                            .inner
                            .fail(CommError::Cancelled("link shut down".into()).to_string());
                        self.cleanup(ticket.op);
                        return;
                    }
                }
                self.requeue(ticket);
                return;
            }
            warn!(
                link = %self.config.name,
                controller = %info.name,
                op = ticket.op.name(),
                attempts = attempt,
                "retries exhausted"
            );
        }
        ticket.op.inner.fail(err.to_string());
        self.cleanup(ticket.op);
    }

    async fn connect(&mut self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            self.set_state(PollerState::Connecting);
            match self.messenger.connect().await {
                Ok(()) => {
                    self.set_status(STATUS_OPEN);
                    info!(
                        link = %self.config.name,
                        transport = self.messenger.kind(),
                        "link connected"
                    );
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    self.set_status(&err.to_string());
                    warn!(link = %self.config.name, attempt, error = %err, "connect failed");
                    if attempt > self.config.retry.max_retries {
                        return Err(err);
                    }
                    self.set_state(PollerState::RetryWait);
                    let delay = self.config.retry.backoff_delay(attempt, &mut self.rng);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wait_shutdown(&mut self.shutdown) => {
                            return Err(CommError::Cancelled("link shut down".into()));
                        }
                    }
                }
            }
        }
    }

    async fn disconnect(&mut self, status: &str) {
        if self.messenger.is_connected() {
            self.messenger.close().await;
            debug!(link = %self.config.name, status, "transport closed");
        }
        self.set_status(status);
    }

    /// Queue a settings download; `false` when the driver has none to send.
    fn request_settings(&self, controller: ControllerId, priority: PriorityLevel) -> bool {
        info!(link = %self.config.name, controller = %controller, "controller requested settings");
        matches!(
            self.link
                .send_request_at(controller, DeviceRequest::SendSettings, priority),
            Some(AddOutcome::Queued | AddOutcome::Duplicate)
        )
    }

    fn requeue(&mut self, ticket: Ticket) {
        let returned = self.link.shared.queue.requeue(ticket);
        self.returned(returned);
    }

    fn returned(&mut self, returned: std::result::Result<(), Ticket>) {
        if let Err(ticket) = returned {
            let mut op = ticket.op;
            op.inner
                .fail(CommError::Cancelled("link shut down".into()).to_string());
            self.cleanup(op);
            return;
        }
        self.link.publish_depth();
    }

    fn record_fault(&self, op: &mut QueuedOp, info: &ControllerInfo, err: &CommError) {
        op.inner.observe_fault(err);
        self.link.registry().record_fault(op.controller(), err);
        if let Some(metrics) = &self.link.shared.metrics {
            metrics.record_fault(&self.config.name, err.class());
        }
        warn!(
            link = %self.config.name,
            controller = %info.name,
            op = op.name(),
            class = %err.class(),
            event = %err.event(),
            error = %err,
            "operation fault"
        );
        self.log.log(
            LogLevel::Warn,
            format_args!("{} {} {}", info.name, err.event(), err),
        );
    }

    fn record_busy(&self, busy: Duration) {
        if let Some(metrics) = &self.link.shared.metrics {
            metrics.observe_phase(&self.config.name, busy);
        }
        let sample = self.link.shared.load.lock().record(busy);
        if let Some(load) = sample {
            trace!(link = %self.config.name, load, "line load sampled");
            if let Some(metrics) = &self.link.shared.metrics {
                metrics.set_line_load(&self.config.name, load);
            }
        }
    }

    fn cleanup(&mut self, mut op: QueuedOp) {
        let controller = op.controller();
        let success = op.succeeded();
        let registry = self.link.registry();
        if success {
            registry.record_success(controller);
        } else {
            registry.record_failure(controller, op.error_status().unwrap_or("failed"));
        }
        registry.set_active_op(controller, None);
        if let Some(metrics) = &self.link.shared.metrics {
            metrics.record_operation(&self.config.name, success);
        }
        self.link.shared.queue.finish(&op);

        let error_status = op.error_status().map(str::to_owned);
        let mut done = Cleanup::new(
            &self.link,
            controller,
            op.priority(),
            success,
            error_status.as_deref(),
        );
        op.inner.cleanup(&mut done);
        debug!(
            link = %self.config.name,
            op = %op.id(),
            name = op.name(),
            controller = %controller,
            success,
            "operation cleaned up"
        );
        self.link.publish_depth();
    }

    async fn terminate(&mut self) {
        self.link.shared.future.cancel_all();
        self.messenger.close().await;
        let drained = self.link.shared.queue.drain();
        let count = drained.len();
        for mut op in drained {
            let err = CommError::Cancelled("queue drained".into());
            if let Some(info) = self.link.registry().info(op.controller()) {
                self.record_fault(&mut op, &info, &err);
            }
            op.inner.fail(err.to_string());
            self.cleanup(op);
        }
        self.set_status(STATUS_CLOSED);
        self.set_state(PollerState::Terminated);
        info!(link = %self.config.name, drained = count, "comm task terminated");
    }

    fn set_state(&self, state: PollerState) {
        *self.link.shared.state.lock() = state;
    }

    fn set_status(&self, status: &str) {
        let mut current = self.link.shared.status.lock();
        if current.as_str() != status {
            *current = status.to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn load_sample_covers_one_interval() {
        let mut sampler = LoadSampler::new(Duration::from_secs(30));
        assert_eq!(sampler.record(Duration::from_secs(3)), None);
        tokio::time::advance(Duration::from_secs(30)).await;
        let load = sampler.record(Duration::from_secs(3)).unwrap();
        assert!((load - 0.2).abs() < 1e-6);
        assert!((sampler.load() - 0.2).abs() < 1e-6);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(sampler.record(Duration::ZERO), Some(0.0));
    }

    #[test]
    fn states_render_like_status_labels() {
        assert_eq!(PollerState::RunningPhase.to_string(), "RUNNING_PHASE");
        assert_eq!(PollerState::RetryWait.to_string(), "RETRY_WAIT");
    }
}
