// Session lifecycle controller

//! Session controller
//!
//! Owns the single VPN session. Requests are admitted through a running
//! flag (an atomic holding the id of the session that owns it) and handed to
//! one worker task, which drives the [`StateManager`] and performs every
//! acquisition and release. Whatever a session acquired is released by one
//! routine, both when a connect attempt fails and when a live session is
//! torn down.
//!
//! ```text
//! connect ──► flag 0→id ──► queue ──► worker: validate ► provision ► start core
//!                                        │ ok: connected, surface, stats ticker
//!                                        └ err: release, clear flag, error event
//! disconnect ► flag id→0 ──► queue ──► worker: release, reset counters, disconnected
//! ```

use crate::error::{CoreError, ProvisionError, SessionError};
use crate::event_bus::EventBus;
use crate::platform::CapabilitySet;
use crate::provisioner::{self, InterfaceParams, InterfaceProvisioner, TunHandle};
use crate::state::{StateAction, StateCommand, StateManager};
use crate::surface::StatusSurface;
use crate::tunnel_core::{CoreContext, CoreHandle, FaultReporter, TunnelCore};
use crate::types::{ConnectionDescriptor, Event, Status, Traffic};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

/// Identifier of one connect attempt and the session it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a session is being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Explicit disconnect request
    User,
    /// The tunnel engine failed while running
    EngineFault(String),
    /// The system withdrew the right to run the VPN
    PermissionRevoked,
    /// The controller is stopping
    Shutdown,
}

impl DisconnectCause {
    /// Message for the `error` event that precedes the teardown, if any
    fn error_message(&self) -> Option<String> {
        match self {
            DisconnectCause::EngineFault(reason) => Some(reason.clone()),
            DisconnectCause::PermissionRevoked => Some(SessionError::PermissionRevoked.to_string()),
            DisconnectCause::User | DisconnectCause::Shutdown => None,
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::User => f.write_str("requested"),
            DisconnectCause::EngineFault(reason) => write!(f, "engine fault: {}", reason),
            DisconnectCause::PermissionRevoked => f.write_str("permission revoked"),
            DisconnectCause::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Tuning for the controller
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Period of `stats_updated` events while connected
    pub stats_interval: Duration,
    /// Upper bound for provisioning, engine start and each release step
    pub step_timeout: Duration,
    /// Capabilities offered to the tunnel core
    pub platform: CapabilitySet,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(1),
            step_timeout: Duration::from_secs(30),
            platform: CapabilitySet::new(),
        }
    }
}

enum Command {
    Connect {
        session: SessionId,
        descriptor: ConnectionDescriptor,
    },
    Disconnect {
        session: SessionId,
        cause: DisconnectCause,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Running flag plus the queue into the worker
///
/// Flag transitions and the matching enqueue happen under the queue lock,
/// so the worker sees commands in the order the flag changed. A connect is
/// refused until every queued teardown has finished.
struct Gate {
    /// Id of the session holding the flag, 0 when clear
    running: AtomicU64,
    /// Teardowns queued or in progress
    teardowns: AtomicUsize,
    next_id: AtomicU64,
    /// None once the controller has shut down
    queue: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl Gate {
    fn new(queue: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            running: AtomicU64::new(0),
            teardowns: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            queue: Mutex::new(Some(queue)),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Test-and-set the flag and enqueue the connect
    fn begin(&self, descriptor: ConnectionDescriptor) -> Result<SessionId, SessionError> {
        let queue = self.lock_queue();
        let tx = queue.as_ref().ok_or(SessionError::Stopped)?;
        if self.teardowns.load(Ordering::Acquire) > 0 {
            return Err(SessionError::AlreadyRunning);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.running
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::AlreadyRunning)?;

        let session = SessionId(id);
        if tx.send(Command::Connect { session, descriptor }).is_err() {
            self.running.store(0, Ordering::Release);
            return Err(SessionError::Stopped);
        }
        Ok(session)
    }

    /// Clear the flag and enqueue the teardown
    ///
    /// With `expected` set, only that session's flag is cleared. Returns
    /// false when there was nothing to tear down.
    fn end(&self, expected: Option<SessionId>, cause: DisconnectCause) -> bool {
        let queue = self.lock_queue();
        let taken = match expected {
            None => self.running.swap(0, Ordering::AcqRel),
            Some(id) => self
                .running
                .compare_exchange(id.0, 0, Ordering::AcqRel, Ordering::Acquire)
                .unwrap_or(0),
        };
        if taken == 0 {
            return false;
        }

        if let Some(tx) = queue.as_ref() {
            self.teardowns.fetch_add(1, Ordering::AcqRel);
            let _ = tx.send(Command::Disconnect {
                session: SessionId(taken),
                cause,
            });
        }
        true
    }

    /// The worker finished handling one queued teardown
    fn teardown_settled(&self) {
        let _ = self
            .teardowns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Clear the flag after a failed attempt, unless a disconnect already did
    fn abandon(&self, id: SessionId) {
        let _ = self
            .running
            .compare_exchange(id.0, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.running.load(Ordering::Acquire) == id.0
    }

    fn is_set(&self) -> bool {
        self.running.load(Ordering::Acquire) != 0
    }

    /// Stop admitting commands, queueing a teardown for any live session
    fn close(&self) -> Option<mpsc::UnboundedSender<Command>> {
        let mut queue = self.lock_queue();
        let tx = queue.take()?;

        let taken = self.running.swap(0, Ordering::AcqRel);
        if taken != 0 {
            self.teardowns.fetch_add(1, Ordering::AcqRel);
            let _ = tx.send(Command::Disconnect {
                session: SessionId(taken),
                cause: DisconnectCause::Shutdown,
            });
        }
        Some(tx)
    }
}

fn lock_status(status: &Mutex<Status>) -> MutexGuard<'_, Status> {
    status.lock().unwrap_or_else(|p| p.into_inner())
}

/// Controller for the single VPN session
pub struct SessionController {
    gate: Arc<Gate>,
    status: Arc<Mutex<Status>>,
    bus: EventBus,
    platform: Arc<CapabilitySet>,
}

impl SessionController {
    /// Create the controller and spawn its worker on the current tokio runtime
    pub fn new(
        provisioner: Arc<dyn InterfaceProvisioner>,
        core: Arc<dyn TunnelCore>,
        surface: Arc<dyn StatusSurface>,
        options: ControllerOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Gate::new(tx));
        let status = Arc::new(Mutex::new(Status::default()));
        let bus = EventBus::new();
        let platform = Arc::new(options.platform);

        let worker = Worker {
            gate: Arc::downgrade(&gate),
            machine: StateManager::new(),
            provisioner,
            core,
            surface,
            bus: bus.clone(),
            status: status.clone(),
            platform: platform.clone(),
            stats_interval: options.stats_interval,
            step_timeout: options.step_timeout,
            session: None,
            orphan: None,
        };
        tokio::spawn(worker.run(rx));

        Self {
            gate,
            status,
            bus,
            platform,
        }
    }

    /// Start a session
    ///
    /// Returns as soon as the request is admitted; progress is reported on
    /// the event bus. A second request while a session is starting or live,
    /// or before a pending teardown has finished, is rejected with
    /// [`SessionError::AlreadyRunning`] and emits nothing.
    pub fn connect(&self, descriptor: ConnectionDescriptor) -> Result<SessionId, SessionError> {
        let label = descriptor.server_label.clone();
        let session = self.gate.begin(descriptor)?;
        log::info!("Connect {} to {} accepted", session, label);
        Ok(session)
    }

    /// Tear down the current session, if any
    ///
    /// Idempotent: with no session starting or live this does nothing and
    /// emits no events. Returns whether a teardown was queued.
    pub fn disconnect(&self) -> bool {
        let queued = self.gate.end(None, DisconnectCause::User);
        if queued {
            log::info!("Disconnect requested");
        } else {
            log::debug!("Disconnect requested with no active session");
        }
        queued
    }

    /// The OS withdrew the right to run a VPN
    pub fn revoke(&self) -> bool {
        log::warn!("VPN permission revoked by the system");
        self.gate.end(None, DisconnectCause::PermissionRevoked)
    }

    /// Snapshot of state and counters
    pub fn status(&self) -> Status {
        lock_status(&self.status).clone()
    }

    /// Whether a session is starting or live
    pub fn is_running(&self) -> bool {
        self.gate.is_set()
    }

    /// Bus the UI subscriber takes events from
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Capabilities offered to tunnel engines
    pub fn platform(&self) -> &CapabilitySet {
        &self.platform
    }

    /// Tear down any session and stop the worker
    ///
    /// Later commands fail with [`SessionError::Stopped`].
    pub async fn shutdown(&self) {
        let Some(tx) = self.gate.close() else {
            return;
        };

        let (done, finished) = oneshot::channel();
        if tx.send(Command::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
        log::info!("Session controller stopped");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // Queued teardown still runs; the worker exits once the queue drains
        drop(self.gate.close());
    }
}

/// Resources held by one session
struct Session {
    id: SessionId,
    server_label: String,
    interface: Option<TunHandle>,
    core: Option<Arc<dyn CoreHandle>>,
    ticker: Option<JoinHandle<()>>,
}

impl Session {
    fn new(id: SessionId, server_label: &str) -> Self {
        Self {
            id,
            server_label: server_label.to_string(),
            interface: None,
            core: None,
            ticker: None,
        }
    }
}

/// Serializes every session transition
struct Worker {
    gate: Weak<Gate>,
    machine: StateManager,
    provisioner: Arc<dyn InterfaceProvisioner>,
    core: Arc<dyn TunnelCore>,
    surface: Arc<dyn StatusSurface>,
    bus: EventBus,
    status: Arc<Mutex<Status>>,
    platform: Arc<CapabilitySet>,
    stats_interval: Duration,
    step_timeout: Duration,
    session: Option<Session>,
    /// Provisioning abandoned by a timeout, released when it completes
    orphan: Option<JoinHandle<()>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect {
                    session,
                    descriptor,
                } => self.connect(session, descriptor).await,
                Command::Disconnect { session, cause } => self.disconnect(session, cause).await,
                Command::Shutdown { done } => {
                    if let Some(id) = self.session.as_ref().map(|s| s.id) {
                        self.disconnect(id, DisconnectCause::Shutdown).await;
                    }
                    self.reap_orphan().await;
                    let _ = done.send(());
                    break;
                }
            }
        }
        self.reap_orphan().await;
        log::debug!("Session worker exited");
    }

    async fn connect(&mut self, id: SessionId, descriptor: ConnectionDescriptor) {
        let action = self.machine.handle_command(StateCommand::Connect);
        if action != StateAction::Establish {
            log::warn!(
                "Connect {} ignored in state {}",
                id,
                self.machine.state()
            );
            self.abandon(id);
            return;
        }
        self.publish_state();

        // A late interface from an earlier attempt goes before a new one is made
        self.reap_orphan().await;

        let mut session = Session::new(id, &descriptor.server_label);
        match self.establish(&mut session, &descriptor).await {
            Ok(()) => {
                if self.machine.handle_command(StateCommand::Established) == StateAction::Activate {
                    self.activate(session).await;
                }
            }
            Err(err) => {
                log::error!("Connect {} failed: {}", id, err);
                if self.machine.handle_command(StateCommand::Failed) == StateAction::Rollback {
                    self.release(session).await;
                    self.abandon(id);
                    self.bus.publish(Event::Error {
                        message: err.to_string(),
                    });
                    self.publish_state();
                }
            }
        }
    }

    /// Validate, provision, start; acquisitions are recorded on `session`
    async fn establish(
        &mut self,
        session: &mut Session,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), SessionError> {
        if descriptor.config.trim().is_empty() {
            return Err(SessionError::empty_configuration());
        }

        let negotiated = self.core.negotiated_options(&descriptor.config);
        let params = provisioner::build_params(negotiated.as_ref(), descriptor);

        let tun = self.provision(params).await?;
        let tun = session.interface.insert(tun);

        let ctx = CoreContext {
            platform: self.platform.clone(),
            faults: self.fault_reporter(session.id),
        };
        let handle = timeout(
            self.step_timeout,
            self.core.start(&descriptor.config, tun, ctx),
        )
        .await
        .map_err(|_| CoreError::TimedOut)??;
        session.core = Some(handle);

        Ok(())
    }

    /// Provision on a separate task so a timeout never drops it half done
    ///
    /// On timeout the task keeps running; whatever it acquires is released
    /// by the orphan reaper instead of leaking.
    async fn provision(&mut self, params: InterfaceParams) -> Result<TunHandle, ProvisionError> {
        let provisioner = self.provisioner.clone();
        let mut attempt = tokio::spawn(async move { provisioner.provision(&params).await });

        match timeout(self.step_timeout, &mut attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ProvisionError::Unavailable(format!(
                "provisioning task failed: {}",
                e
            ))),
            Err(_) => {
                let provisioner = self.provisioner.clone();
                self.orphan = Some(tokio::spawn(async move {
                    let Ok(Ok(tun)) = attempt.await else {
                        return;
                    };
                    let name = tun.name().to_string();
                    log::warn!("Releasing interface {} provisioned after timeout", name);
                    if let Err(e) = provisioner.release(tun).await {
                        log::warn!(
                            "{}",
                            SessionError::ResourceReleaseFailed(format!(
                                "interface {}: {}",
                                name, e
                            ))
                        );
                    }
                }));
                Err(ProvisionError::TimedOut)
            }
        }
    }

    async fn reap_orphan(&mut self) {
        if let Some(orphan) = self.orphan.take() {
            log::debug!("Waiting for abandoned provisioning to finish");
            let _ = orphan.await;
        }
    }

    async fn activate(&mut self, mut session: Session) {
        log::info!("Session {} connected to {}", session.id, session.server_label);
        self.publish_state();
        self.surface.session_active(&session.server_label).await;

        let interface = session.interface.as_ref().map(|t| t.name().to_string());
        session.ticker = session
            .core
            .clone()
            .map(|core| self.spawn_stats_ticker(session.id, core, interface));
        self.session = Some(session);
    }

    async fn disconnect(&mut self, id: SessionId, cause: DisconnectCause) {
        if let Some(current) = self.session.as_ref().map(|s| s.id) {
            if current != id {
                log::warn!("Ignoring disconnect for {}, live session is {}", id, current);
                self.teardown_settled();
                return;
            }
        }

        if self.machine.handle_command(StateCommand::Disconnect) != StateAction::Teardown {
            self.teardown_settled();
            return;
        }

        log::info!("Disconnecting {} ({})", id, cause);
        if let Some(message) = cause.error_message() {
            self.bus.publish(Event::Error { message });
        }
        self.publish_state();

        if let Some(session) = self.session.take() {
            self.release(session).await;
        }

        let finished = self.machine.handle_command(StateCommand::TornDown) == StateAction::Finish;
        self.teardown_settled();
        if finished {
            {
                let mut status = lock_status(&self.status);
                status.bytes_in = 0;
                status.bytes_out = 0;
            }
            self.publish_state();
            self.surface.session_inactive().await;
            log::info!("Session {} disconnected", id);
        }
    }

    /// Release everything a session holds, each step independent of the others
    async fn release(&self, mut session: Session) {
        if let Some(ticker) = session.ticker.take() {
            ticker.abort();
            let _ = ticker.await;
        }

        if let Some(core) = session.core.take() {
            if timeout(self.step_timeout, core.stop()).await.is_err() {
                log::warn!(
                    "{}",
                    SessionError::ResourceReleaseFailed(format!(
                        "tunnel core of {} (stop timed out)",
                        session.id
                    ))
                );
            }
        }

        if let Some(tun) = session.interface.take() {
            let name = tun.name().to_string();
            let failure = match timeout(self.step_timeout, self.provisioner.release(tun)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("timed out".to_string()),
            };
            if let Some(reason) = failure {
                log::warn!(
                    "{}",
                    SessionError::ResourceReleaseFailed(format!("interface {}: {}", name, reason))
                );
            }
        }
    }

    fn teardown_settled(&self) {
        if let Some(gate) = self.gate.upgrade() {
            gate.teardown_settled();
        }
    }

    fn abandon(&self, id: SessionId) {
        if let Some(gate) = self.gate.upgrade() {
            gate.abandon(id);
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        lock_status(&self.status).state = state;
        self.bus.publish(Event::StateChanged { state });
    }

    /// Reporter that tears down `id` and nothing newer
    fn fault_reporter(&self, id: SessionId) -> FaultReporter {
        let gate = self.gate.clone();
        FaultReporter::new(move |reason| {
            let Some(gate) = gate.upgrade() else {
                return;
            };
            if gate.end(Some(id), DisconnectCause::EngineFault(reason.clone())) {
                log::error!("Session {} lost: {}", id, reason);
            } else {
                log::debug!("Ignoring fault from finished session {}: {}", id, reason);
            }
        })
    }

    /// Periodic `stats_updated` while `id` holds the running flag
    ///
    /// Each tick also checks that the interface still exists; one removed
    /// from outside revokes the session.
    fn spawn_stats_ticker(
        &self,
        id: SessionId,
        core: Arc<dyn CoreHandle>,
        interface: Option<String>,
    ) -> JoinHandle<()> {
        let gate = self.gate.clone();
        let provisioner = self.provisioner.clone();
        let status = self.status.clone();
        let bus = self.bus.clone();
        let period = self.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(live) = gate.upgrade().filter(|g| g.is_current(id)) else {
                    break;
                };
                if let Some(name) = interface.as_deref() {
                    if !provisioner.is_present(name) {
                        log::error!("Interface {} disappeared, revoking session {}", name, id);
                        live.end(Some(id), DisconnectCause::PermissionRevoked);
                        break;
                    }
                }
                drop(live);
                let Some(sample) = core.traffic() else {
                    continue;
                };

                let traffic = {
                    let mut status = lock_status(&status);
                    status.bytes_in = status.bytes_in.max(sample.bytes_in);
                    status.bytes_out = status.bytes_out.max(sample.bytes_out);
                    Traffic {
                        bytes_in: status.bytes_in,
                        bytes_out: status.bytes_out,
                    }
                };
                bus.publish(Event::stats(traffic));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetworkParams, SessionState, TunOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Tracks how many handles of one kind are live at once
    #[derive(Default)]
    struct Live {
        acquired: AtomicUsize,
        released: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    impl Live {
        fn acquire(&self) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(now, Ordering::SeqCst);
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_sub(1, Ordering::SeqCst);
        }

        fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        fn max_live(&self) -> usize {
            self.max_live.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct MockProvisioner {
        live: Live,
        fail: Mutex<Option<ProvisionError>>,
        fail_release: AtomicBool,
        delay: Mutex<Option<Duration>>,
        /// Keeps working after acquiring, like a provisioner still configuring
        hold: Mutex<Option<Duration>>,
        /// Interface removed from outside
        gone: AtomicBool,
        last_params: Mutex<Option<provisioner::InterfaceParams>>,
    }

    #[async_trait]
    impl InterfaceProvisioner for MockProvisioner {
        async fn provision(
            &self,
            params: &provisioner::InterfaceParams,
        ) -> Result<TunHandle, ProvisionError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            *self.last_params.lock().unwrap() = Some(params.clone());
            if let Some(err) = self.fail.lock().unwrap().clone() {
                return Err(err);
            }
            self.live.acquire();
            let hold = *self.hold.lock().unwrap();
            if let Some(hold) = hold {
                tokio::time::sleep(hold).await;
            }
            Ok(TunHandle::new("vpns0", params.clone()))
        }

        async fn release(&self, _handle: TunHandle) -> Result<(), ProvisionError> {
            self.live.release();
            if self.fail_release.load(Ordering::SeqCst) {
                return Err(ProvisionError::Rejected("device busy".to_string()));
            }
            Ok(())
        }

        fn is_present(&self, _name: &str) -> bool {
            !self.gone.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CoreShared {
        live: Live,
        traffic: Mutex<Option<Traffic>>,
    }

    #[derive(Default)]
    struct MockCore {
        shared: Arc<CoreShared>,
        fail: Mutex<Option<String>>,
        negotiated: Mutex<Option<TunOptions>>,
        reporters: Mutex<Vec<FaultReporter>>,
    }

    impl MockCore {
        fn set_traffic(&self, bytes_in: u64, bytes_out: u64) {
            *self.shared.traffic.lock().unwrap() = Some(Traffic {
                bytes_in,
                bytes_out,
            });
        }

        fn reporter(&self, index: usize) -> FaultReporter {
            self.reporters.lock().unwrap()[index].clone()
        }
    }

    struct MockHandle {
        shared: Arc<CoreShared>,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl CoreHandle for MockHandle {
        async fn stop(&self) {
            if !self.stopped.swap(true, Ordering::SeqCst) {
                self.shared.live.release();
            }
        }

        fn traffic(&self) -> Option<Traffic> {
            *self.shared.traffic.lock().unwrap()
        }
    }

    #[async_trait]
    impl TunnelCore for MockCore {
        fn negotiated_options(&self, _config: &str) -> Option<TunOptions> {
            self.negotiated.lock().unwrap().clone()
        }

        async fn start(
            &self,
            _config: &str,
            _tun: &TunHandle,
            ctx: CoreContext,
        ) -> Result<Arc<dyn CoreHandle>, CoreError> {
            if let Some(reason) = self.fail.lock().unwrap().clone() {
                return Err(CoreError::Rejected(reason));
            }
            self.shared.live.acquire();
            self.reporters.lock().unwrap().push(ctx.faults);
            Ok(Arc::new(MockHandle {
                shared: self.shared.clone(),
                stopped: AtomicBool::new(false),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StatusSurface for RecordingSurface {
        async fn session_active(&self, server_label: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("active:{}", server_label));
        }

        async fn session_inactive(&self) {
            self.calls.lock().unwrap().push("inactive".to_string());
        }
    }

    struct Harness {
        controller: SessionController,
        provisioner: Arc<MockProvisioner>,
        core: Arc<MockCore>,
        surface: Arc<RecordingSurface>,
        events: mpsc::Receiver<Event>,
    }

    fn harness_with(options: ControllerOptions) -> Harness {
        let provisioner = Arc::new(MockProvisioner::default());
        let core = Arc::new(MockCore::default());
        let surface = Arc::new(RecordingSurface::default());
        let controller = SessionController::new(
            provisioner.clone(),
            core.clone(),
            surface.clone(),
            options,
        );
        let events = controller.events().subscribe_with_capacity(256);
        Harness {
            controller,
            provisioner,
            core,
            surface,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(ControllerOptions {
            stats_interval: Duration::from_secs(3600),
            ..ControllerOptions::default()
        })
    }

    fn descriptor(config: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            config: config.to_string(),
            server_label: "Test Server".to_string(),
            network: NetworkParams::default(),
        }
    }

    fn state(state: SessionState) -> Event {
        Event::StateChanged { state }
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn expect_events(rx: &mut mpsc::Receiver<Event>, expected: &[Event]) {
        for event in expected {
            assert_eq!(&next_event(rx).await, event);
        }
    }

    /// Let the worker drain its queue
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn expect_quiet(rx: &mut mpsc::Receiver<Event>) {
        settle().await;
        assert!(rx.try_recv().is_err(), "unexpected event");
    }

    async fn connected(h: &mut Harness) {
        h.controller.connect(descriptor("{\"outbounds\":[]}")).unwrap();
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Connecting),
                state(SessionState::Connected),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn test_connect_success() {
        let mut h = harness();
        connected(&mut h).await;

        assert_eq!(
            h.controller.status(),
            Status {
                state: SessionState::Connected,
                bytes_in: 0,
                bytes_out: 0
            }
        );
        assert!(h.controller.is_running());
        assert_eq!(h.provisioner.live.live(), 1);
        assert_eq!(h.core.shared.live.live(), 1);
        assert_eq!(
            *h.surface.calls.lock().unwrap(),
            vec!["active:Test Server".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_configuration() {
        let mut h = harness();
        h.controller.connect(descriptor("")).unwrap();

        expect_events(
            &mut h.events,
            &[
                state(SessionState::Connecting),
                Event::Error {
                    message: "Configuration is empty".to_string(),
                },
                state(SessionState::Error),
            ],
        )
        .await;

        assert_eq!(h.provisioner.live.acquired(), 0);
        assert_eq!(h.core.shared.live.acquired(), 0);
        assert!(!h.controller.is_running());
        assert_eq!(h.controller.status().state, SessionState::Error);
    }

    #[tokio::test]
    async fn test_provision_failure_skips_core() {
        let mut h = harness();
        *h.provisioner.fail.lock().unwrap() = Some(ProvisionError::PermissionDenied(
            "Operation not permitted".to_string(),
        ));

        h.controller.connect(descriptor("{}")).unwrap();
        expect_events(&mut h.events, &[state(SessionState::Connecting)]).await;

        match next_event(&mut h.events).await {
            Event::Error { message } => {
                assert!(message.starts_with("Failed to establish VPN interface"), "{}", message)
            }
            other => panic!("unexpected event {:?}", other),
        }
        expect_events(&mut h.events, &[state(SessionState::Error)]).await;

        assert_eq!(h.core.shared.live.acquired(), 0);
        assert!(!h.controller.is_running());
    }

    #[tokio::test]
    async fn test_core_failure_releases_interface() {
        let mut h = harness();
        *h.core.fail.lock().unwrap() = Some("bad outbound".to_string());

        h.controller.connect(descriptor("{}")).unwrap();
        expect_events(&mut h.events, &[state(SessionState::Connecting)]).await;
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        expect_events(&mut h.events, &[state(SessionState::Error)]).await;

        assert_eq!(h.provisioner.live.acquired(), 1);
        assert_eq!(h.provisioner.live.live(), 0);
        assert!(h.surface.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_connect_rejected() {
        let mut h = harness();
        h.controller.connect(descriptor("{}")).unwrap();
        let second = h.controller.connect(descriptor("{}"));
        assert!(matches!(second, Err(SessionError::AlreadyRunning)));

        expect_events(
            &mut h.events,
            &[
                state(SessionState::Connecting),
                state(SessionState::Connected),
            ],
        )
        .await;
        expect_quiet(&mut h.events).await;
        assert_eq!(h.provisioner.live.acquired(), 1);
    }

    #[tokio::test]
    async fn test_connect_while_connected_rejected() {
        let mut h = harness();
        connected(&mut h).await;

        assert!(matches!(
            h.controller.connect(descriptor("{}")),
            Err(SessionError::AlreadyRunning)
        ));
        expect_quiet(&mut h.events).await;
    }

    #[tokio::test]
    async fn test_connect_rejected_while_disconnecting() {
        let mut h = harness();
        connected(&mut h).await;

        assert!(h.controller.disconnect());
        assert!(!h.controller.is_running());
        assert!(matches!(
            h.controller.connect(descriptor("{}")),
            Err(SessionError::AlreadyRunning)
        ));

        expect_events(
            &mut h.events,
            &[
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
        expect_quiet(&mut h.events).await;
        assert_eq!(h.provisioner.live.acquired(), 1);

        // Accepted again once the teardown has finished
        connected(&mut h).await;
        assert_eq!(h.provisioner.live.max_live(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let mut h = harness();
        assert!(!h.controller.disconnect());
        assert!(!h.controller.disconnect());

        expect_quiet(&mut h.events).await;
        assert_eq!(h.controller.status().state, SessionState::Disconnected);
        assert!(h.surface.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let mut h = harness();
        connected(&mut h).await;

        assert!(h.controller.disconnect());
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;

        assert_eq!(h.provisioner.live.live(), 0);
        assert_eq!(h.core.shared.live.live(), 0);
        assert_eq!(h.controller.status(), Status::default());
        assert!(!h.controller.is_running());
        assert_eq!(
            *h.surface.calls.lock().unwrap(),
            vec!["active:Test Server".to_string(), "inactive".to_string()]
        );

        // Second disconnect does nothing
        assert!(!h.controller.disconnect());
        expect_quiet(&mut h.events).await;
    }

    #[tokio::test]
    async fn test_reconnect_after_failure() {
        let mut h = harness();
        h.controller.connect(descriptor("")).unwrap();
        expect_events(&mut h.events, &[state(SessionState::Connecting)]).await;
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        expect_events(&mut h.events, &[state(SessionState::Error)]).await;

        connected(&mut h).await;
    }

    #[tokio::test]
    async fn test_disconnect_after_failure_settles_disconnected() {
        let mut h = harness();
        *h.provisioner.delay.lock().unwrap() = Some(Duration::from_millis(20));
        h.controller.connect(descriptor("")).unwrap();
        assert!(h.controller.disconnect());

        expect_events(&mut h.events, &[state(SessionState::Connecting)]).await;
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Error),
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_tears_down() {
        let mut h = harness();
        *h.provisioner.delay.lock().unwrap() = Some(Duration::from_millis(100));

        h.controller.connect(descriptor("{}")).unwrap();
        assert!(h.controller.disconnect());
        assert!(!h.controller.is_running());

        expect_events(
            &mut h.events,
            &[
                state(SessionState::Connecting),
                state(SessionState::Connected),
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
        assert_eq!(h.provisioner.live.live(), 0);
        assert_eq!(h.core.shared.live.live(), 0);
    }

    #[tokio::test]
    async fn test_engine_fault_drives_disconnect() {
        let mut h = harness();
        connected(&mut h).await;

        h.core.reporter(0).report("engine crashed");
        expect_events(
            &mut h.events,
            &[
                Event::Error {
                    message: "engine crashed".to_string(),
                },
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
        assert_eq!(h.provisioner.live.live(), 0);
        assert!(!h.controller.is_running());
    }

    #[tokio::test]
    async fn test_stale_fault_ignored() {
        let mut h = harness();
        connected(&mut h).await;
        h.controller.disconnect();
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;

        connected(&mut h).await;
        h.core.reporter(0).report("late fault from first engine");

        expect_quiet(&mut h.events).await;
        assert_eq!(h.controller.status().state, SessionState::Connected);
        assert_eq!(h.core.shared.live.live(), 1);
    }

    #[tokio::test]
    async fn test_revoke_drives_disconnect() {
        let mut h = harness();
        connected(&mut h).await;

        assert!(h.controller.revoke());
        expect_events(
            &mut h.events,
            &[
                Event::Error {
                    message: "VPN permission revoked".to_string(),
                },
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn test_release_failure_still_disconnects() {
        let mut h = harness();
        h.provisioner.fail_release.store(true, Ordering::SeqCst);
        connected(&mut h).await;

        h.controller.disconnect();
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
        assert_eq!(h.core.shared.live.live(), 0);

        // The next session can still start
        connected(&mut h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_published_and_reset() {
        let mut h = harness_with(ControllerOptions {
            stats_interval: Duration::from_secs(1),
            ..ControllerOptions::default()
        });
        connected(&mut h).await;

        h.core.set_traffic(100, 50);
        assert_eq!(
            next_event(&mut h.events).await,
            Event::StatsUpdated {
                bytes_in: 100,
                bytes_out: 50
            }
        );
        assert_eq!(h.controller.status().bytes_in, 100);

        h.core.set_traffic(300, 70);
        assert_eq!(
            next_event(&mut h.events).await,
            Event::StatsUpdated {
                bytes_in: 300,
                bytes_out: 70
            }
        );

        h.controller.disconnect();
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
        assert_eq!(h.controller.status(), Status::default());

        // No tick after disconnected
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_timeout_is_failure() {
        let mut h = harness_with(ControllerOptions {
            step_timeout: Duration::from_secs(2),
            stats_interval: Duration::from_secs(3600),
            ..ControllerOptions::default()
        });
        *h.provisioner.delay.lock().unwrap() = Some(Duration::from_secs(10));

        h.controller.connect(descriptor("{}")).unwrap();
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Connecting),
                Event::Error {
                    message: "Failed to establish VPN interface: timed out".to_string(),
                },
                state(SessionState::Error),
            ],
        )
        .await;
        assert_eq!(h.provisioner.live.acquired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_acquired_after_timeout_is_released() {
        let mut h = harness_with(ControllerOptions {
            step_timeout: Duration::from_secs(2),
            stats_interval: Duration::from_secs(3600),
            ..ControllerOptions::default()
        });
        *h.provisioner.hold.lock().unwrap() = Some(Duration::from_secs(10));

        h.controller.connect(descriptor("{}")).unwrap();
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Connecting),
                Event::Error {
                    message: "Failed to establish VPN interface: timed out".to_string(),
                },
                state(SessionState::Error),
            ],
        )
        .await;
        // Still held by the provisioner that outlived the timeout
        assert_eq!(h.provisioner.live.live(), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.provisioner.live.live(), 0);
        assert_eq!(h.provisioner.live.released(), 1);
        assert_eq!(h.core.shared.live.acquired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_for_timed_out_provisioning() {
        let mut h = harness_with(ControllerOptions {
            step_timeout: Duration::from_secs(2),
            stats_interval: Duration::from_secs(3600),
            ..ControllerOptions::default()
        });
        *h.provisioner.hold.lock().unwrap() = Some(Duration::from_secs(4));

        h.controller.connect(descriptor("{}")).unwrap();
        expect_events(&mut h.events, &[state(SessionState::Connecting)]).await;
        assert!(matches!(next_event(&mut h.events).await, Event::Error { .. }));
        expect_events(&mut h.events, &[state(SessionState::Error)]).await;

        *h.provisioner.hold.lock().unwrap() = None;
        connected(&mut h).await;

        assert_eq!(h.provisioner.live.acquired(), 2);
        assert_eq!(h.provisioner.live.live(), 1);
        assert_eq!(h.provisioner.live.max_live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_removed_revokes_session() {
        let mut h = harness_with(ControllerOptions {
            stats_interval: Duration::from_secs(1),
            ..ControllerOptions::default()
        });
        connected(&mut h).await;

        h.provisioner.gone.store(true, Ordering::SeqCst);
        expect_events(
            &mut h.events,
            &[
                Event::Error {
                    message: "VPN permission revoked".to_string(),
                },
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
        assert_eq!(h.core.shared.live.live(), 0);
        assert!(!h.controller.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_negotiated_options_reach_provisioner() {
        let mut h = harness();
        *h.core.negotiated.lock().unwrap() = Some(TunOptions {
            mtu: Some(9000),
            ..TunOptions::default()
        });
        connected(&mut h).await;

        let params = h.provisioner.last_params.lock().unwrap().clone().unwrap();
        assert_eq!(params.mtu, 9000);
        assert_eq!(params.label, "Test Server");
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_and_stops() {
        let mut h = harness();
        connected(&mut h).await;

        h.controller.shutdown().await;
        expect_events(
            &mut h.events,
            &[
                state(SessionState::Disconnecting),
                state(SessionState::Disconnected),
            ],
        )
        .await;
        assert_eq!(h.provisioner.live.live(), 0);

        assert!(matches!(
            h.controller.connect(descriptor("{}")),
            Err(SessionError::Stopped)
        ));
        assert!(!h.controller.disconnect());
        // Second shutdown returns immediately
        h.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_at_most_one_session_live() {
        let h = harness();

        for round in 0..25 {
            let _ = h.controller.connect(descriptor("{}"));
            let _ = h.controller.connect(descriptor("{}"));
            for _ in 0..(round % 4) {
                tokio::task::yield_now().await;
            }
            if round % 3 == 0 {
                let latest = h.core.reporters.lock().unwrap().last().cloned();
                if let Some(reporter) = latest {
                    reporter.report("flaky engine");
                }
            }
            h.controller.disconnect();
        }
        settle().await;

        assert!(h.provisioner.live.max_live() <= 1);
        assert!(h.core.shared.live.max_live() <= 1);
        assert_eq!(h.provisioner.live.live(), 0);
        assert_eq!(h.core.shared.live.live(), 0);
        assert_eq!(h.controller.status().state, SessionState::Disconnected);
    }
}
