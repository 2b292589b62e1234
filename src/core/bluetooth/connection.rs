//! Bluetooth connection handling for a configured peripheral
//! This module supervises one peripheral's lifecycle: connect with retry,
//! characteristic resolution, update delivery and reconnect after a drop.
//!
//! Each session is an actor. A single task owns every mutable field and
//! consumes [`SessionEvent`]s in order; transport work runs in spawned tasks
//! that post their completion back tagged with the connection epoch, so a
//! result that arrives after the world moved on is recognised and discarded.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::core::bluetooth::characteristic::CharacteristicBinding;
use crate::core::bluetooth::constants::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, BRIDGE_OPERATION_TIMEOUT_SECS, CONNECT_RETRY_DELAY_MS,
    CONNECT_TIMEOUT_MS, RECONNECT_SETTLE_DELAY_MS,
};
use crate::core::bluetooth::error::{
    BridgeError, ConnectError, ResolveError, TransportError, UpdateError,
};
use crate::core::bluetooth::notification::{StateListener, UpdateSource};
use crate::core::bluetooth::resolver::CharacteristicResolver;
use crate::core::bluetooth::transport::{DisconnectStream, PeripheralHandle, PeripheralLocator};
use crate::core::bluetooth::types::{ConnectionState, DeviceTarget, UpdateMode};

/// Timing knobs of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Delay before a failed connect attempt is retried
    pub retry_delay: Duration,
    /// Pause between an unsolicited disconnect and the reconnect attempt
    pub settle_delay: Duration,
    /// Upper bound for locating plus connecting the peripheral
    pub connect_timeout: Duration,
    /// Upper bound for host-initiated reads and writes
    pub bridge_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(CONNECT_RETRY_DELAY_MS),
            settle_delay: Duration::from_millis(RECONNECT_SETTLE_DELAY_MS),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            bridge_timeout: Duration::from_secs(BRIDGE_OPERATION_TIMEOUT_SECS),
        }
    }
}

/// Snapshot of a session, published after every transition
#[derive(Debug, Clone)]
pub struct SessionView {
    pub state: ConnectionState,
    /// Connection attempt counter; bumps on every attempt
    pub epoch: u64,
    /// Bound characteristic, present only in `Ready`
    pub binding: Option<CharacteristicBinding>,
    /// Whether a retry or reconnect timer is armed
    pub retry_pending: bool,
    /// Persistent problem with the current link, cleared on reconnect
    pub fault: Option<String>,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            binding: None,
            retry_pending: false,
            fault: None,
        }
    }
}

type ConnectReply = oneshot::Sender<Result<(), ConnectError>>;

/// A connected peripheral together with its disconnect signal
struct Link {
    peripheral: PeripheralHandle,
    disconnects: DisconnectStream,
}

enum SessionEvent {
    EnsureConnected {
        reply: Option<ConnectReply>,
    },
    ConnectFinished {
        epoch: u64,
        result: Result<Link, ConnectError>,
    },
    ResolveFinished {
        epoch: u64,
        result: Result<CharacteristicBinding, ResolveError>,
    },
    UpdatesStarted {
        epoch: u64,
        binding: CharacteristicBinding,
        result: Result<UpdateSource, UpdateError>,
    },
    Disconnected {
        epoch: u64,
    },
    UpdatesEnded {
        epoch: u64,
    },
    RetryElapsed {
        timer: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Reports the outcome of a connect attempt exactly once.
/// If the attempt task goes away without reporting, the drop posts `Abandoned`
/// so the session never stays stuck in `Connecting`.
struct ConnectAttempt {
    epoch: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    reported: bool,
}

impl ConnectAttempt {
    /// Posts the result. Hands the link back if the session is gone.
    fn complete(mut self, result: Result<Link, ConnectError>) -> Option<Link> {
        self.reported = true;
        let event = SessionEvent::ConnectFinished {
            epoch: self.epoch,
            result,
        };
        match self.events.send(event) {
            Ok(()) => None,
            Err(mpsc::error::SendError(SessionEvent::ConnectFinished {
                result: Ok(link), ..
            })) => Some(link),
            Err(_) => None,
        }
    }

    /// Drops the result without reporting (the session is shutting down)
    fn dismiss(mut self) {
        self.reported = true;
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        if !self.reported {
            let _ = self.events.send(SessionEvent::ConnectFinished {
                epoch: self.epoch,
                result: Err(ConnectError::Abandoned),
            });
        }
    }
}

/// The live state of one configured peripheral
pub struct PeripheralSession {
    target: DeviceTarget,
    mode: UpdateMode,
    config: SessionConfig,
    locator: Arc<dyn PeripheralLocator>,
    listener: Arc<dyn StateListener>,
    events: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Sender<SessionView>,
    shutdown: CancellationToken,

    state: ConnectionState,
    epoch: u64,
    attempt_in_progress: bool,
    attempt_reply: Option<ConnectReply>,
    next_timer: u64,
    retry_timer: Option<(u64, JoinHandle<()>)>,
    peripheral: Option<PeripheralHandle>,
    disconnect_watch: Option<JoinHandle<()>>,
    binding: Option<CharacteristicBinding>,
    updates: Option<UpdateSource>,
    fault: Option<String>,
}

impl PeripheralSession {
    /// Starts the session task and returns a handle to it.
    /// The session idles in `Disconnected` until asked to connect.
    pub fn spawn(
        target: DeviceTarget,
        mode: UpdateMode,
        locator: Arc<dyn PeripheralLocator>,
        listener: Arc<dyn StateListener>,
        config: SessionConfig,
    ) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(SessionView::default());
        let shutdown = CancellationToken::new();

        let handle = SessionHandle {
            target: target.clone(),
            events: events_tx.clone(),
            view: view_rx,
            bridge_timeout: config.bridge_timeout,
            _alive: Arc::new(shutdown.clone().drop_guard()),
        };

        let session = Self {
            target,
            mode,
            config,
            locator,
            listener,
            events: events_tx,
            view: view_tx,
            shutdown,
            state: ConnectionState::Disconnected,
            epoch: 0,
            attempt_in_progress: false,
            attempt_reply: None,
            next_timer: 0,
            retry_timer: None,
            peripheral: None,
            disconnect_watch: None,
            binding: None,
            updates: None,
            fault: None,
        };
        tokio::spawn(session.run(events_rx));

        handle
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        debug!(
            "[{}] (by:BLE) -> session started in {} mode",
            self.target.name(),
            self.mode
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                event = events.recv() => event,
            };

            match event {
                Some(SessionEvent::Shutdown { reply }) => {
                    self.close(&mut events).await;
                    let _ = reply.send(());
                    return;
                }
                Some(event) => {
                    self.handle(event);
                    self.publish();
                }
                None => {
                    self.close(&mut events).await;
                    return;
                }
            }
        }
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::EnsureConnected { reply } => self.on_ensure_connected(reply),
            SessionEvent::ConnectFinished { epoch, result } => {
                self.on_connect_finished(epoch, result)
            }
            SessionEvent::ResolveFinished { epoch, result } => {
                self.on_resolve_finished(epoch, result)
            }
            SessionEvent::UpdatesStarted {
                epoch,
                binding,
                result,
            } => self.on_updates_started(epoch, binding, result),
            SessionEvent::Disconnected { epoch } => self.on_disconnected(epoch),
            SessionEvent::UpdatesEnded { epoch } => self.on_updates_ended(epoch),
            SessionEvent::RetryElapsed { timer } => self.on_retry_elapsed(timer),
            SessionEvent::Shutdown { .. } => {}
        }
    }

    fn on_ensure_connected(&mut self, reply: Option<ConnectReply>) {
        match self.state {
            state if state.is_linked() => {
                debug!(
                    "[{}] (by:BLE) -> connection already established.",
                    self.target.name()
                );
                Self::answer(reply, Ok(()));
            }
            ConnectionState::Connecting => {
                debug!(
                    "[{}] (by:BLE) -> already trying to connect ...",
                    self.target.name()
                );
                Self::answer(reply, Ok(()));
            }
            _ => self.start_attempt(reply),
        }
    }

    fn start_attempt(&mut self, reply: Option<ConnectReply>) {
        if self.attempt_in_progress {
            Self::answer(reply, Ok(()));
            return;
        }

        self.epoch += 1;
        self.attempt_in_progress = true;
        self.attempt_reply = reply;
        self.state = ConnectionState::Connecting;
        debug!("[{}] (by:BLE) trying to connect ...", self.target.name());

        let attempt = ConnectAttempt {
            epoch: self.epoch,
            events: self.events.clone(),
            reported: false,
        };
        let locator = self.locator.clone();
        let target = self.target.clone();
        let shutdown = self.shutdown.clone();
        let limit = self.config.connect_timeout;

        tokio::spawn(async move {
            let result = match timeout(limit, Self::connect_peripheral(locator, &target)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(limit)),
            };

            let orphaned = if shutdown.is_cancelled() {
                attempt.dismiss();
                result.ok()
            } else {
                attempt.complete(result)
            };

            if let Some(link) = orphaned {
                debug!(
                    "[{}] (by:BLE) -> session closed while connecting, releasing peripheral",
                    target.name()
                );
                let _ = link.peripheral.disconnect().await;
            }
        });
    }

    async fn connect_peripheral(
        locator: Arc<dyn PeripheralLocator>,
        target: &DeviceTarget,
    ) -> Result<Link, ConnectError> {
        let peripheral = locator.locate(target).await?;
        let disconnects = peripheral.disconnections().await?;

        if !peripheral.is_connected().await {
            info!(
                "[{}] (by:BLE) -> initiating connection to {}...",
                target.name(),
                peripheral.id()
            );
            peripheral.connect().await?;
        }

        Ok(Link {
            peripheral,
            disconnects,
        })
    }

    fn on_connect_finished(&mut self, epoch: u64, result: Result<Link, ConnectError>) {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(
                "[{}] (by:BLE) -> ignoring stale connect result (epoch {})",
                self.target.name(),
                epoch
            );
            if let Ok(link) = result {
                tokio::spawn(async move {
                    let _ = link.peripheral.disconnect().await;
                });
            }
            return;
        }

        self.attempt_in_progress = false;
        let reply = self.attempt_reply.take();

        match result {
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                warn!(
                    "[{}] (by:BLE) -> [ERROR] could not connect to BLE device: {}",
                    self.target.name(),
                    e
                );
                self.arm_retry(self.config.retry_delay);
                self.publish();
                Self::answer(reply, Err(e));
            }
            Ok(link) => {
                self.cancel_retry();
                info!("[{}] (by:BLE) -> connected", self.target.name());
                self.fault = None;
                self.peripheral = Some(link.peripheral.clone());
                self.watch_disconnects(link.disconnects);
                self.state = ConnectionState::Connected;
                self.publish();
                Self::answer(reply, Ok(()));
                self.start_resolve(link.peripheral);
            }
        }
    }

    fn watch_disconnects(&mut self, mut disconnects: DisconnectStream) {
        let epoch = self.epoch;
        let events = self.events.clone();
        let name = self.target.name().to_string();

        let watcher = tokio::spawn(async move {
            if disconnects.next().await.is_none() {
                debug!("[{}] (by:BLE) -> disconnect signal closed", name);
            }
            let _ = events.send(SessionEvent::Disconnected { epoch });
        });

        if let Some(previous) = self.disconnect_watch.replace(watcher) {
            previous.abort();
        }
    }

    fn start_resolve(&mut self, peripheral: PeripheralHandle) {
        self.state = ConnectionState::Resolving;

        let epoch = self.epoch;
        let events = self.events.clone();
        let target = self.target.clone();
        tokio::spawn(async move {
            let result = CharacteristicResolver::resolve(peripheral.as_ref(), &target, epoch).await;
            let _ = events.send(SessionEvent::ResolveFinished { epoch, result });
        });
    }

    fn on_resolve_finished(
        &mut self,
        epoch: u64,
        result: Result<CharacteristicBinding, ResolveError>,
    ) {
        if epoch != self.epoch || self.state != ConnectionState::Resolving {
            debug!(
                "[{}] (by:BLE) -> ignoring stale resolve result (epoch {})",
                self.target.name(),
                epoch
            );
            return;
        }

        match result {
            Err(e) => {
                warn!(
                    "[{}] (by:BLE) -> characteristic unavailable until the next reconnect: {}",
                    self.target.name(),
                    e
                );
                self.fault = Some(e.to_string());
                self.state = ConnectionState::Connected;
            }
            Ok(binding) => {
                self.stop_updates();
                debug!("[{}] (by:BLE) -> binding event handlers", self.target.name());

                let events = self.events.clone();
                let mode = self.mode;
                let listener = self.listener.clone();
                let label = self.target.name().to_string();
                tokio::spawn(async move {
                    let mut source = UpdateSource::new(label);
                    let result = source
                        .start(&binding, mode, listener)
                        .await
                        .map(|()| source);
                    let _ = events.send(SessionEvent::UpdatesStarted {
                        epoch,
                        binding,
                        result,
                    });
                });
            }
        }
    }

    fn on_updates_started(
        &mut self,
        epoch: u64,
        binding: CharacteristicBinding,
        result: Result<UpdateSource, UpdateError>,
    ) {
        if epoch != self.epoch || self.state != ConnectionState::Resolving {
            // Dropping a stale source stops it.
            debug!(
                "[{}] (by:BLE) -> discarding updates of stale epoch {}",
                self.target.name(),
                epoch
            );
            return;
        }

        match result {
            Err(e) => {
                warn!(
                    "[{}] (by:BLE) -> updates unavailable until the next reconnect: {}",
                    self.target.name(),
                    e
                );
                self.fault = Some(e.to_string());
                self.state = ConnectionState::Connected;
            }
            Ok(source) => {
                let finished = source.finished();
                let events = self.events.clone();
                tokio::spawn(async move {
                    if finished.await {
                        let _ = events.send(SessionEvent::UpdatesEnded { epoch });
                    }
                });
                self.updates = Some(source);
                self.binding = Some(binding);
                self.state = ConnectionState::Ready;
                info!(
                    "[{}] (by:BLE) -> connection successfully established.",
                    self.target.name()
                );
            }
        }
    }

    fn on_disconnected(&mut self, epoch: u64) {
        if epoch != self.epoch || !self.state.is_linked() {
            debug!(
                "[{}] (by:BLE) -> ignoring disconnect of epoch {} in state {}",
                self.target.name(),
                epoch,
                self.state
            );
            return;
        }

        self.teardown_link();
        self.state = ConnectionState::Disconnected;
        info!(
            "[{}] (by:BLE) -> disconnected. Trying to reconnect in {} ms ...",
            self.target.name(),
            self.config.settle_delay.as_millis()
        );
        self.arm_retry(self.config.settle_delay);
    }

    /// The peripheral stopped notifying while the link looked healthy.
    /// Treated like a drop so the next connect subscribes again.
    fn on_updates_ended(&mut self, epoch: u64) {
        if epoch != self.epoch || self.state != ConnectionState::Ready {
            return;
        }
        warn!(
            "[{}] (by:BLE) -> notifications stopped while connected",
            self.target.name()
        );
        self.on_disconnected(epoch);
    }

    fn on_retry_elapsed(&mut self, timer: u64) {
        let armed = self.retry_timer.as_ref().map(|(id, _)| *id);
        if armed != Some(timer) {
            return;
        }
        self.retry_timer = None;

        if self.state == ConnectionState::Disconnected {
            self.start_attempt(None);
        }
    }

    /// Arms the retry timer unless one is already armed
    fn arm_retry(&mut self, delay: Duration) {
        if self.retry_timer.is_some() {
            debug!(
                "[{}] (by:BLE) -> retry already scheduled",
                self.target.name()
            );
            return;
        }

        self.next_timer += 1;
        let timer = self.next_timer;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(SessionEvent::RetryElapsed { timer });
        });
        self.retry_timer = Some((timer, handle));
    }

    fn cancel_retry(&mut self) {
        if let Some((_, handle)) = self.retry_timer.take() {
            handle.abort();
        }
    }

    fn stop_updates(&mut self) {
        if let Some(mut updates) = self.updates.take() {
            updates.stop();
        }
    }

    /// Releases everything derived from the current link
    fn teardown_link(&mut self) {
        self.stop_updates();
        self.binding = None;
        if let Some(watcher) = self.disconnect_watch.take() {
            watcher.abort();
        }
        self.peripheral = None;
    }

    async fn close(&mut self, events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        self.shutdown.cancel();
        self.cancel_retry();

        // A connect attempt may have finished after the shutdown was queued.
        // Its link is still waiting in the queue and must be released too.
        events.close();
        let mut released = Vec::new();
        let mut waiting = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::ConnectFinished {
                    result: Ok(link), ..
                } => released.push(link.peripheral),
                SessionEvent::Shutdown { reply } => waiting.push(reply),
                _ => {}
            }
        }

        let peripheral = self.peripheral.take();
        self.teardown_link();
        if let Some(peripheral) = peripheral {
            released.insert(0, peripheral);
        }
        for peripheral in released {
            self.release(peripheral).await;
        }

        Self::answer(self.attempt_reply.take(), Err(ConnectError::ShuttingDown));
        self.state = ConnectionState::Disconnected;
        self.publish();
        info!("[{}] (by:BLE) -> session closed", self.target.name());
        for reply in waiting {
            let _ = reply.send(());
        }
    }

    async fn release(&self, peripheral: PeripheralHandle) {
        let limit = Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS);
        match timeout(limit, peripheral.disconnect()).await {
            Ok(Ok(())) => info!("[{}] (by:BLE) -> disconnected", self.target.name()),
            Ok(Err(e)) => error!(
                "[{}] (by:BLE) -> error while disconnecting: {}",
                self.target.name(),
                e
            ),
            Err(_) => error!(
                "[{}] (by:BLE) -> timed out while disconnecting",
                self.target.name()
            ),
        }
    }

    fn publish(&self) {
        let binding = match self.state {
            ConnectionState::Ready => {
                debug_assert!(self.binding.is_some(), "Ready without a bound characteristic");
                self.binding.clone()
            }
            _ => None,
        };

        self.view.send_replace(SessionView {
            state: self.state,
            epoch: self.epoch,
            binding,
            retry_pending: self.retry_timer.is_some(),
            fault: self.fault.clone(),
        });
    }

    fn answer(reply: Option<ConnectReply>, result: Result<(), ConnectError>) {
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

/// Cloneable handle to a running session.
/// When the last handle is dropped the session shuts itself down.
#[derive(Clone)]
pub struct SessionHandle {
    target: DeviceTarget,
    events: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Receiver<SessionView>,
    bridge_timeout: Duration,
    _alive: Arc<DropGuard>,
}

impl SessionHandle {
    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    /// Connects unless already connected or connecting.
    /// Resolves when the attempt this call started finishes; returns `Ok`
    /// immediately if a link exists or another attempt is pending.
    pub async fn ensure_connected(&self) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::EnsureConnected { reply: Some(tx) })
            .map_err(|_| ConnectError::ShuttingDown)?;
        rx.await.unwrap_or(Err(ConnectError::ShuttingDown))
    }

    /// Same as [`SessionHandle::ensure_connected`] without waiting for the outcome
    pub fn request_connect(&self) {
        let _ = self
            .events
            .send(SessionEvent::EnsureConnected { reply: None });
    }

    /// Signals that the link dropped
    pub fn on_unexpected_disconnect(&self) {
        let epoch = self.view.borrow().epoch;
        let _ = self.events.send(SessionEvent::Disconnected { epoch });
    }

    /// Cancels timers, stops updates and releases the peripheral.
    /// Returns once the session has torn everything down.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(SessionEvent::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.view.borrow().state
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Waits until the session reaches `state`. Returns false if the session ended first.
    pub async fn wait_for_state(&self, state: ConnectionState) -> bool {
        let mut view = self.view.clone();
        view.wait_for(|v| v.state == state).await.is_ok()
    }

    /// Reads the current state. Fails fast with `NotReady` unless the session is `Ready`.
    pub async fn get_state(&self) -> Result<bool, BridgeError> {
        let binding = self.ready_binding()?;
        match timeout(self.bridge_timeout, binding.read_state()).await {
            Ok(Err(BridgeError::TransportFailure(e))) => {
                self.report_failure(&binding, &e);
                Err(BridgeError::TransportFailure(e))
            }
            Ok(result) => result,
            Err(_) => Err(BridgeError::TransportFailure(TransportError::Timeout)),
        }
    }

    /// Writes the state. Failures are reported, never retried.
    pub async fn set_state(&self, value: bool) -> Result<(), BridgeError> {
        let binding = self.ready_binding()?;
        match timeout(self.bridge_timeout, binding.write_state(value)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.report_failure(&binding, &e);
                Err(BridgeError::TransportFailure(e))
            }
            Err(_) => Err(BridgeError::TransportFailure(TransportError::Timeout)),
        }
    }

    fn ready_binding(&self) -> Result<CharacteristicBinding, BridgeError> {
        let view = self.view.borrow();
        if view.state != ConnectionState::Ready {
            return Err(BridgeError::NotReady);
        }
        match &view.binding {
            Some(binding) => Ok(binding.clone()),
            None => unreachable!(
                "session {} is Ready without a bound characteristic",
                self.target
            ),
        }
    }

    /// A transport-level disconnect runs the normal disconnect path
    fn report_failure(&self, binding: &CharacteristicBinding, error: &TransportError) {
        if error.is_disconnect() {
            let _ = self.events.send(SessionEvent::Disconnected {
                epoch: binding.epoch(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::testing::{
        FakeCharacteristic, FakeLocator, FakePeripheral, RecordingListener,
    };
    use crate::core::bluetooth::transport::Peripheral;

    const CHARACTERISTIC_UUID: &str = "0000ffe1-0000-1000-8000-00805f9b34fb";

    struct Fixture {
        characteristic: Arc<FakeCharacteristic>,
        peripheral: Arc<FakePeripheral>,
        locator: Arc<FakeLocator>,
        listener: Arc<RecordingListener>,
        session: SessionHandle,
    }

    fn target() -> DeviceTarget {
        DeviceTarget::new(
            "Desk Lamp",
            "AA:BB:CC:DD:EE:FF",
            "0000FFE0-0000-1000-8000-00805F9B34FB",
            "0000FFE1-0000-1000-8000-00805F9B34FB",
        )
    }

    fn spawn_session(
        peripheral: Arc<FakePeripheral>,
        characteristic: Arc<FakeCharacteristic>,
        mode: UpdateMode,
    ) -> Fixture {
        let locator = FakeLocator::new(&peripheral);
        let listener = RecordingListener::new();
        let session = PeripheralSession::spawn(
            target(),
            mode,
            locator.clone(),
            listener.clone(),
            SessionConfig::default(),
        );
        Fixture {
            characteristic,
            peripheral,
            locator,
            listener,
            session,
        }
    }

    fn fixture(mode: UpdateMode) -> Fixture {
        let characteristic = FakeCharacteristic::new(CHARACTERISTIC_UUID);
        let peripheral = FakePeripheral::new("AA:BB:CC:DD:EE:FF").with_characteristic(&characteristic);
        spawn_session(peripheral, characteristic, mode)
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    async fn ready(mode: UpdateMode) -> Fixture {
        let f = fixture(mode);
        f.session.ensure_connected().await.unwrap();
        settle().await;
        assert_eq!(f.session.state(), ConnectionState::Ready);
        f
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_resolves_and_becomes_ready() {
        let f = ready(UpdateMode::Push).await;

        let view = f.session.view();
        assert_eq!(view.epoch, 1);
        assert!(view.binding.is_some());
        assert!(!view.retry_pending);
        assert!(view.fault.is_none());
        assert_eq!(f.peripheral.connects(), 1);
        assert_eq!(f.characteristic.live_subscribers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_while_connecting_issues_one_connect() {
        let f = fixture(UpdateMode::Push);
        f.peripheral.hold_connects();

        let first = {
            let session = f.session.clone();
            tokio::spawn(async move { session.ensure_connected().await })
        };
        assert!(f.session.wait_for_state(ConnectionState::Connecting).await);

        assert_eq!(f.session.ensure_connected().await, Ok(()));
        settle().await;
        assert_eq!(f.peripheral.connects(), 1);
        assert_eq!(f.locator.locates(), 1);

        f.peripheral.release_connect();
        assert_eq!(first.await.unwrap(), Ok(()));
        settle().await;

        assert_eq!(f.session.state(), ConnectionState::Ready);
        assert_eq!(f.session.ensure_connected().await, Ok(()));
        assert_eq!(f.peripheral.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_share_a_single_retry_timer() {
        let f = fixture(UpdateMode::Push);
        f.peripheral.fail_next_connects(10);

        let result = f.session.ensure_connected().await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert!(f.session.view().retry_pending);

        // A second failure while the timer is armed must not arm another one.
        assert!(f.session.ensure_connected().await.is_err());
        assert_eq!(f.peripheral.connects(), 2);

        sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS + 100)).await;
        assert_eq!(f.peripheral.connects(), 3);

        sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS)).await;
        assert_eq!(f.peripheral.connects(), 4);
        assert!(f.session.view().retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_reconnects_after_failure() {
        let f = fixture(UpdateMode::Push);
        f.peripheral.fail_next_connects(1);

        assert!(f.session.ensure_connected().await.is_err());
        sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS + 100)).await;

        assert_eq!(f.session.state(), ConnectionState::Ready);
        assert_eq!(f.peripheral.connects(), 2);
        assert!(!f.session.view().retry_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_in_ready_tears_down_and_reconnects_once() {
        let f = ready(UpdateMode::Push).await;

        f.peripheral.drop_link();
        settle().await;

        let view = f.session.view();
        assert_eq!(view.state, ConnectionState::Disconnected);
        assert!(view.binding.is_none());
        assert!(view.retry_pending);
        assert_eq!(f.characteristic.live_subscribers(), 0);
        assert_eq!(f.session.get_state().await, Err(BridgeError::NotReady));
        assert_eq!(f.peripheral.connects(), 1);

        sleep(Duration::from_millis(RECONNECT_SETTLE_DELAY_MS)).await;
        assert_eq!(f.peripheral.connects(), 2);
        assert_eq!(f.session.state(), ConnectionState::Ready);
        assert_eq!(f.session.view().epoch, 2);
        assert_eq!(f.characteristic.live_subscribers(), 1);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(f.peripheral.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_characteristics_leaves_session_connected() {
        let f = spawn_session(
            FakePeripheral::new("AA:BB:CC:DD:EE:FF"),
            FakeCharacteristic::new(CHARACTERISTIC_UUID),
            UpdateMode::Push,
        );

        f.session.ensure_connected().await.unwrap();
        settle().await;

        let view = f.session.view();
        assert_eq!(view.state, ConnectionState::Connected);
        assert_eq!(
            view.fault.as_deref(),
            Some(ResolveError::NoCharacteristicsFound.to_string().as_str())
        );
        assert_eq!(f.session.get_state().await, Err(BridgeError::NotReady));
        assert_eq!(f.session.set_state(true).await, Err(BridgeError::NotReady));

        sleep(Duration::from_secs(60)).await;
        assert_eq!(f.peripheral.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_leaves_session_connected() {
        let f = fixture(UpdateMode::Push);
        f.characteristic
            .fail_subscribe(Some(TransportError::Other("cccd write failed".to_string())));

        f.session.ensure_connected().await.unwrap();
        settle().await;

        assert_eq!(f.session.state(), ConnectionState::Connected);
        assert!(f.session.view().fault.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_round_trip() {
        let f = ready(UpdateMode::Push).await;

        f.session.set_state(true).await.unwrap();
        assert_eq!(f.session.get_state().await, Ok(true));

        f.session.set_state(false).await.unwrap();
        assert_eq!(f.session.get_state().await, Ok(false));

        assert_eq!(f.characteristic.writes(), vec![vec![0x01], vec![0x00]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_state_before_connect_fails_fast() {
        let f = fixture(UpdateMode::Push);

        assert_eq!(f.session.get_state().await, Err(BridgeError::NotReady));
        assert_eq!(f.characteristic.reads(), 0);
        assert_eq!(f.locator.locates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_notification_reaches_listener_without_read() {
        let f = ready(UpdateMode::Push).await;

        f.characteristic.notify(&[0x01]);
        settle().await;

        assert_eq!(f.listener.events(), vec![true]);
        assert_eq!(f.characteristic.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_mode_reads_on_interval() {
        let f = ready(UpdateMode::Poll(Duration::from_millis(1000))).await;

        sleep(Duration::from_millis(2500)).await;

        assert_eq!(f.listener.events(), vec![false, false]);
        assert_eq!(f.characteristic.reads(), 2);
        assert_eq!(f.characteristic.live_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_keeps_session_ready() {
        let f = ready(UpdateMode::Push).await;
        f.characteristic
            .fail_writes(Some(TransportError::Other("write not permitted".to_string())));

        let result = f.session.set_state(true).await;
        settle().await;

        assert_eq!(
            result,
            Err(BridgeError::TransportFailure(TransportError::Other(
                "write not permitted".to_string()
            )))
        );
        assert_eq!(f.session.state(), ConnectionState::Ready);
        assert_eq!(f.locator.locates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_on_disconnect_runs_disconnect_path() {
        let f = ready(UpdateMode::Push).await;
        f.characteristic.fail_writes(Some(TransportError::Disconnected));

        let result = f.session.set_state(true).await;
        settle().await;

        assert_eq!(
            result,
            Err(BridgeError::TransportFailure(TransportError::Disconnected))
        );
        assert_eq!(f.session.state(), ConnectionState::Disconnected);

        sleep(Duration::from_millis(RECONNECT_SETTLE_DELAY_MS)).await;
        assert_eq!(f.locator.locates(), 2);
        assert_eq!(f.session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_disconnect_signal_is_ignored() {
        let f = ready(UpdateMode::Push).await;
        f.session.on_unexpected_disconnect();
        sleep(Duration::from_millis(RECONNECT_SETTLE_DELAY_MS + 100)).await;
        assert_eq!(f.session.view().epoch, 2);

        // A late signal for the first link must not tear down the second one.
        f.session.events.send(SessionEvent::Disconnected { epoch: 1 }).unwrap();
        settle().await;

        assert_eq!(f.session.state(), ConnectionState::Ready);
        assert_eq!(f.locator.locates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_backoff_cancels_retry() {
        let f = fixture(UpdateMode::Push);
        f.peripheral.fail_next_connects(10);
        assert!(f.session.ensure_connected().await.is_err());

        f.session.shutdown().await;
        sleep(Duration::from_secs(60)).await;

        assert_eq!(f.peripheral.connects(), 1);
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(
            f.session.ensure_connected().await,
            Err(ConnectError::ShuttingDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_connect_releases_late_peripheral() {
        let f = fixture(UpdateMode::Push);
        f.peripheral.hold_connects();
        let pending = {
            let session = f.session.clone();
            tokio::spawn(async move { session.ensure_connected().await })
        };
        assert!(f.session.wait_for_state(ConnectionState::Connecting).await);
        settle().await;

        f.session.shutdown().await;
        f.peripheral.release_connect();
        settle().await;

        assert_eq!(pending.await.unwrap(), Err(ConnectError::ShuttingDown));
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(f.peripheral.disconnects(), 1);
        assert_eq!(f.characteristic.live_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_finishing_behind_shutdown_is_released() {
        let f = fixture(UpdateMode::Push);
        f.peripheral.hold_connects();
        let pending = {
            let session = f.session.clone();
            tokio::spawn(async move { session.ensure_connected().await })
        };
        assert!(f.session.wait_for_state(ConnectionState::Connecting).await);
        settle().await;

        f.peripheral.release_connect();
        f.session.shutdown().await;
        settle().await;

        assert_eq!(pending.await.unwrap(), Err(ConnectError::ShuttingDown));
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(f.peripheral.connects(), 1);
        assert_eq!(f.peripheral.disconnects(), 1);
        assert!(!f.peripheral.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_mid_connect_releases_peripheral() {
        let Fixture {
            peripheral,
            session,
            ..
        } = fixture(UpdateMode::Push);
        peripheral.hold_connects();
        session.request_connect();
        assert!(session.wait_for_state(ConnectionState::Connecting).await);
        settle().await;

        peripheral.release_connect();
        drop(session);
        settle().await;

        assert_eq!(peripheral.connects(), 1);
        assert_eq!(peripheral.disconnects(), 1);
        assert!(!peripheral.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_notifications_resubscribe_after_settle() {
        let f = ready(UpdateMode::Push).await;

        f.characteristic.end_notifications();
        settle().await;
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert!(f.session.view().retry_pending);

        sleep(Duration::from_millis(RECONNECT_SETTLE_DELAY_MS + 100)).await;

        assert_eq!(f.session.state(), ConnectionState::Ready);
        assert_eq!(f.session.view().epoch, 2);
        assert_eq!(f.characteristic.live_subscribers(), 1);
        f.characteristic.notify(&[0x01]);
        settle().await;
        assert_eq!(f.listener.events(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_in_ready_disconnects_peripheral() {
        let f = ready(UpdateMode::Push).await;

        f.session.shutdown().await;
        settle().await;

        assert_eq!(f.session.state(), ConnectionState::Disconnected);
        assert_eq!(f.peripheral.disconnects(), 1);
        assert_eq!(f.characteristic.live_subscribers(), 0);
        f.characteristic.notify(&[0x01]);
        settle().await;
        assert!(f.listener.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_closes_session() {
        let f = ready(UpdateMode::Push).await;
        let peripheral = f.peripheral.clone();

        drop(f);
        settle().await;

        assert_eq!(peripheral.disconnects(), 1);
    }
}
