//! Session Manager
//!
//! Owns the radio adapter handle, every known device session and the single
//! connected-device slot. Adapter events are drained from one channel by one
//! dispatch task and applied in arrival order; commands suspend their caller
//! on a registered waiter, never on the dispatch task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::adapter::{
    AdapterError, AdapterState, DeviceId, EventSink, RadioAdapter, RadioEvent, ScanFilter,
    ServiceDescriptor,
};
use super::characteristic::CharacteristicSession;
use super::device::{ConnectionState, DeviceSession, Transition};
use super::pending::{Delivery, Pending};
use super::relay::{Observable, StateRelay};
use super::SessionError;
use crate::config::SessionConfig;

/// Snapshot of manager bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub known_devices: usize,
    pub connected_device: Option<DeviceId>,
    pub adapter_state: AdapterState,
    pub scanning: bool,
    pub stale_events_dropped: u64,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceId, DeviceSession>,
    /// Device with a connect attempt in flight
    connecting: Option<DeviceId>,
}

enum ConnectPlan {
    AlreadyConnected,
    Join,
    Start,
}

/// State shared by the manager handle, the dispatch task and every session
pub(crate) struct Core {
    this: Weak<Core>,
    adapter: Arc<dyn RadioAdapter>,
    config: SessionConfig,
    sink: EventSink,
    adapter_state: StateRelay<AdapterState>,
    registry: Mutex<Registry>,
    discovered: StateRelay<Vec<DeviceSession>>,
    connected: StateRelay<Option<DeviceSession>>,
    scanning: StateRelay<bool>,
    last_error: StateRelay<Option<String>>,
    stale_events: AtomicU64,
}

/// Resolve a session's non-owning handle to its manager
pub(crate) fn upgrade(core: &Weak<Core>) -> Result<Arc<Core>, SessionError> {
    core.upgrade().ok_or(SessionError::SessionNotAvailable)
}

/// Publish `error` on the manager's last-error stream, if the manager is alive
pub(crate) fn report(core: &Weak<Core>, error: SessionError) -> SessionError {
    match core.upgrade() {
        Some(core) => core.report(error),
        None => error,
    }
}

impl Core {
    pub(crate) fn adapter(&self) -> &Arc<dyn RadioAdapter> {
        &self.adapter
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn report(&self, error: SessionError) -> SessionError {
        tracing::warn!("session operation failed: {}", error);
        self.last_error.set(Some(error.to_string()));
        error
    }

    fn device(&self, id: &str) -> Option<DeviceSession> {
        self.registry.lock().devices.get(id).cloned()
    }

    fn require_device(&self, id: &str) -> Result<DeviceSession, SessionError> {
        self.device(id)
            .ok_or_else(|| self.report(SessionError::UnknownDevice(id.to_string())))
    }

    /// GATT operations need an established link
    pub(crate) fn require_connected(&self, id: &str) -> Result<(), SessionError> {
        match self.device(id) {
            Some(device) if device.state() == ConnectionState::Connected => Ok(()),
            _ => Err(self.report(SessionError::SessionNotAvailable)),
        }
    }

    fn release_connecting(&self, id: &str) {
        let mut registry = self.registry.lock();
        if registry.connecting.as_deref() == Some(id) {
            registry.connecting = None;
        }
    }

    async fn start_scanning(&self, services: Option<Vec<Uuid>>) -> Result<(), SessionError> {
        let state = self.adapter_state.get();
        if !state.is_ready() {
            return Err(self.report(SessionError::AdapterNotReady(state)));
        }

        let filter = ScanFilter {
            services: services.unwrap_or_default(),
            allow_duplicates: false,
        };
        tracing::info!("Starting scan (service filter: {:?})", filter.services);
        self.adapter
            .scan(&filter)
            .await
            .map_err(|e| self.report(SessionError::from_adapter("scan", e)))?;
        self.scanning.set_if_changed(true);
        Ok(())
    }

    async fn stop_scanning(&self) {
        if let Err(e) = self.adapter.stop_scan().await {
            tracing::warn!("Adapter refused to stop scanning: {}", e);
        }
        if self.scanning.set_if_changed(false) {
            tracing::info!("Scan stopped");
        }
    }

    pub(crate) async fn connect(&self, id: &str) -> Result<DeviceSession, SessionError> {
        let device = self.require_device(id)?;
        let state = self.adapter_state.get();
        if !state.is_ready() {
            return Err(self.report(SessionError::AdapterNotReady(state)));
        }

        let plan = {
            let mut registry = self.registry.lock();
            let in_flight = registry.connecting.clone();
            match (device.state(), in_flight) {
                (ConnectionState::Connected, _) => ConnectPlan::AlreadyConnected,
                (_, Some(pending)) if pending == id => ConnectPlan::Join,
                (_, Some(pending)) => {
                    return Err(self.report(SessionError::ConnectionInProgress(pending)));
                }
                (ConnectionState::Disconnecting, None) => {
                    return Err(self.report(SessionError::InvalidState {
                        device: id.to_string(),
                        operation: "connect",
                        state: ConnectionState::Disconnecting,
                    }));
                }
                (_, None) => {
                    registry.connecting = Some(id.to_string());
                    ConnectPlan::Start
                }
            }
        };

        match plan {
            ConnectPlan::AlreadyConnected => return Ok(device),
            ConnectPlan::Join => {
                tracing::debug!(device = %id, "joining connect attempt in flight");
                let pending = device.connects().register();
                return self.await_connect(&device, pending).await;
            }
            ConnectPlan::Start => {}
        }

        if let Err(e) = self.prepare_connect(&device).await {
            self.release_connecting(id);
            device.connects().resolve_all(Err(e.clone()));
            return Err(e);
        }

        let pending = device.connects().register();
        device.transition(Transition::ConnectRequested);
        tracing::info!(device = %id, "🔗 Connecting");
        if let Err(e) = self.adapter.connect(id).await {
            device.connects().withdraw(pending.id());
            device.transition(Transition::ConnectFailed);
            self.release_connecting(id);
            let error = self.report(SessionError::from_adapter("connect", e));
            device.connects().resolve_all(Err(error.clone()));
            return Err(error);
        }

        self.await_connect(&device, pending).await
    }

    /// Free the single connection slot and quiet the radio before connecting
    async fn prepare_connect(&self, device: &DeviceSession) -> Result<(), SessionError> {
        let previous = self
            .connected
            .get()
            .filter(|connected| !connected.same_session(device));
        if let Some(previous) = previous {
            tracing::info!(
                device = %device.id(),
                "Disconnecting {} before switching connection",
                previous.id()
            );
            self.disconnect(previous.id()).await?;
        }
        if self.config.stop_scan_on_connect && self.scanning.get() {
            self.stop_scanning().await;
        }
        Ok(())
    }

    async fn await_connect(
        &self,
        device: &DeviceSession,
        pending: Pending<Result<(), SessionError>>,
    ) -> Result<DeviceSession, SessionError> {
        let op = pending.id();
        match pending.wait_timeout(self.config.connect_timeout(), "connect").await {
            Ok(Ok(())) => Ok(device.clone()),
            Ok(Err(e)) => Err(self.report(e)),
            Err(SessionError::OperationTimedOut(operation)) => {
                device.connects().withdraw(op);
                if device.state() == ConnectionState::Connecting {
                    self.abandon_connect(device).await;
                }
                Err(self.report(SessionError::OperationTimedOut(operation)))
            }
            Err(e) => Err(self.report(e)),
        }
    }

    /// Roll a timed-out attempt back to disconnected and ask the radio to stop
    async fn abandon_connect(&self, device: &DeviceSession) {
        tracing::warn!(device = %device.id(), "Connect timed out, cancelling attempt");
        device.transition(Transition::ConnectFailed);
        self.release_connecting(device.id());
        device
            .connects()
            .resolve_all(Err(SessionError::OperationTimedOut("connect")));
        if let Err(e) = self.adapter.disconnect(device.id()).await {
            tracing::debug!(device = %device.id(), "Cancel of connect attempt failed: {}", e);
        }
    }

    pub(crate) async fn disconnect(&self, id: &str) -> Result<(), SessionError> {
        let device = self.require_device(id)?;
        let pending = match device.state() {
            ConnectionState::Disconnected => return Ok(()),
            ConnectionState::Connecting => {
                return Err(self.report(SessionError::InvalidState {
                    device: id.to_string(),
                    operation: "disconnect",
                    state: ConnectionState::Connecting,
                }));
            }
            ConnectionState::Disconnecting => device.disconnects().register(),
            ConnectionState::Connected => {
                let pending = device.disconnects().register();
                device.transition(Transition::DisconnectRequested);
                tracing::info!(device = %id, "Disconnecting");
                if let Err(e) = self.adapter.disconnect(id).await {
                    device.disconnects().withdraw(pending.id());
                    device.transition(Transition::DisconnectRefused);
                    return Err(self.report(SessionError::from_adapter("disconnect", e)));
                }
                pending
            }
        };

        let op = pending.id();
        match pending
            .wait_timeout(self.config.operation_timeout(), "disconnect")
            .await
        {
            Ok(_) => Ok(()),
            Err(SessionError::OperationTimedOut(operation)) => {
                device.disconnects().withdraw(op);
                tracing::warn!(device = %id, "Disconnect not confirmed, dropping link locally");
                self.drop_link(&device, Transition::Disconnected, None);
                Err(self.report(SessionError::OperationTimedOut(operation)))
            }
            Err(e) => Err(self.report(e)),
        }
    }

    fn characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicSession, SessionError> {
        self.require_device(device)?
            .require_service(service)
            .and_then(|service| service.require_characteristic(characteristic))
            .map_err(|e| self.report(e))
    }

    fn drop_stale(&self, kind: &'static str, device: &str) {
        self.stale_events.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(device = %device, "Dropped stale {} event", kind);
    }

    /// Apply one adapter event; called only from the dispatch task
    pub(crate) fn handle_event(&self, event: RadioEvent) {
        tracing::trace!(
            kind = event.kind(),
            device = event.device_id().unwrap_or("-"),
            "radio event"
        );
        let kind = event.kind();

        match event {
            RadioEvent::PowerStateChanged(state) => self.apply_power_state(state),
            RadioEvent::DeviceDiscovered { id, name, rssi } => self.apply_discovery(id, name, rssi),
            RadioEvent::Connected { id } => match self.device(&id) {
                Some(device) => self.apply_connected(&device),
                None => self.drop_stale(kind, &id),
            },
            RadioEvent::Disconnected { id, error } => match self.device(&id) {
                Some(device) => self.drop_link(&device, Transition::Disconnected, error),
                None => self.drop_stale(kind, &id),
            },
            RadioEvent::ConnectFailed { id, error } => match self.device(&id) {
                Some(device) => {
                    let error = error
                        .unwrap_or_else(|| AdapterError::Rejected("connection failed".to_string()));
                    self.drop_link(&device, Transition::ConnectFailed, Some(error));
                }
                None => self.drop_stale(kind, &id),
            },
            RadioEvent::ServicesDiscovered { id, services, error } => match self.device(&id) {
                Some(device) => {
                    let auto = error.is_none() && self.config.auto_discover_characteristics;
                    device.apply_services(&services, error);
                    if auto {
                        self.discover_all_characteristics(&device, &services);
                    }
                }
                None => self.drop_stale(kind, &id),
            },
            RadioEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
                error,
            } => {
                let routed = self
                    .device(&id)
                    .and_then(|device| device.route_characteristics(service, &characteristics, error));
                if routed.is_none() {
                    self.drop_stale(kind, &id);
                }
            }
            RadioEvent::ValueUpdated {
                id,
                service,
                characteristic,
                value,
                error,
            } => {
                let delivery = self
                    .device(&id)
                    .and_then(|device| device.route(service, characteristic))
                    .map(|characteristic| characteristic.apply_value(value, error));
                match delivery {
                    Some(Delivery::Delivered(_)) | Some(Delivery::Unclaimed) => {}
                    Some(Delivery::Abandoned(_)) | None => self.drop_stale(kind, &id),
                }
            }
            RadioEvent::WriteCompleted {
                id,
                service,
                characteristic,
                error,
            } => {
                let delivery = self
                    .device(&id)
                    .and_then(|device| device.route(service, characteristic))
                    .map(|characteristic| characteristic.apply_write_complete(error));
                if !matches!(delivery, Some(Delivery::Delivered(_))) {
                    self.drop_stale(kind, &id);
                }
            }
            RadioEvent::NotifyStateChanged {
                id,
                service,
                characteristic,
                is_notifying,
                error,
            } => match self
                .device(&id)
                .and_then(|device| device.route(service, characteristic))
            {
                Some(characteristic) => characteristic.apply_notify_state(is_notifying, error),
                None => self.drop_stale(kind, &id),
            },
        }
    }

    fn apply_power_state(&self, state: AdapterState) {
        let previous = self.adapter_state.get();
        if !self.adapter_state.set_if_changed(state) {
            return;
        }
        tracing::info!("📡 Adapter state: {} -> {}", previous, state);
        if state.is_ready() {
            return;
        }

        self.scanning.set_if_changed(false);
        let devices: Vec<DeviceSession> = self.registry.lock().devices.values().cloned().collect();
        for device in devices
            .iter()
            .filter(|device| device.state() != ConnectionState::Disconnected)
        {
            self.drop_link(device, Transition::Disconnected, Some(AdapterError::Disconnected));
        }
    }

    fn apply_discovery(&self, id: DeviceId, name: Option<String>, rssi: i16) {
        let known = self.registry.lock().devices.get(&id).cloned();
        if let Some(device) = known {
            device.seen(name, rssi);
            return;
        }

        tracing::info!(device = %id, "🔍 Discovered {:?} (RSSI: {})", name, rssi);
        let device = DeviceSession::new(self.this.clone(), id.clone(), name, rssi);
        self.registry.lock().devices.insert(id, device.clone());
        self.discovered.update(|list| {
            list.push(device);
            true
        });
    }

    fn apply_connected(&self, device: &DeviceSession) {
        if !device.transition(Transition::Connected) {
            self.drop_stale("connected", device.id());
            return;
        }
        // only the device holding the connecting slot can get here; any
        // earlier connection was released before its connect was issued
        self.release_connecting(device.id());
        self.connected.set(Some(device.clone()));
        tracing::info!(device = %device.id(), "✅ Connected");
        device.connects().resolve_all(Ok(()));
    }

    /// Take a device down to disconnected
    ///
    /// Clears the connected slot, fails outstanding connect and GATT work and
    /// completes pending disconnects. Service and characteristic caches stay.
    fn drop_link(&self, device: &DeviceSession, transition: Transition, error: Option<AdapterError>) {
        let id = device.id();
        if device.state() == ConnectionState::Disconnected {
            tracing::debug!(device = %id, "Already disconnected");
            return;
        }
        device.transition(transition);
        match &error {
            Some(e) => tracing::warn!(device = %id, "❌ Link down: {}", e),
            None => tracing::info!(device = %id, "Disconnected"),
        }

        self.connected.update(|connected| {
            if connected.as_ref().is_some_and(|c| c.same_session(device)) {
                *connected = None;
                true
            } else {
                false
            }
        });
        self.release_connecting(id);

        let error = SessionError::from_adapter("connect", error.unwrap_or(AdapterError::Disconnected));
        device.connects().resolve_all(Err(error));
        device.disconnects().resolve_all(Ok(()));
        device.fail_pending(&AdapterError::Disconnected);
    }

    fn discover_all_characteristics(
        &self,
        device: &DeviceSession,
        services: &[ServiceDescriptor],
    ) {
        for service in services.iter().filter_map(|s| device.service(s.uuid)) {
            tokio::spawn(async move {
                if let Err(e) = service.discover_characteristics().await {
                    tracing::debug!(service = %service.uuid(), "Characteristic discovery failed: {}", e);
                }
            });
        }
    }

    /// Fail everything still waiting; the dispatch task is gone
    fn teardown(&self) {
        let devices: Vec<DeviceSession> = self.registry.lock().devices.values().cloned().collect();
        for device in &devices {
            device.connects().resolve_all(Err(SessionError::SessionNotAvailable));
            device.disconnects().resolve_all(Ok(()));
            device.fail_pending(&AdapterError::Disconnected);
        }
    }
}

async fn run_dispatch(core: Arc<Core>, mut events: mpsc::UnboundedReceiver<RadioEvent>) {
    while let Some(event) = events.recv().await {
        core.handle_event(event);
    }
    tracing::debug!("Radio event channel closed");
}

struct Dispatcher {
    core: Arc<Core>,
    task: JoinHandle<()>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.task.abort();
        self.core.teardown();
    }
}

/// Top-level controller of the BLE session layer
///
/// Cheap to clone; the dispatch task stops when the last clone is dropped.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<Core>,
    _dispatcher: Arc<Dispatcher>,
}

impl SessionManager {
    /// Create a manager driving `adapter`
    ///
    /// Must be called from within a tokio runtime: the event dispatch task is
    /// spawned here.
    pub fn new(adapter: Arc<dyn RadioAdapter>, config: SessionConfig) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        let core = Arc::new_cyclic(|this| Core {
            this: this.clone(),
            adapter: adapter.clone(),
            config,
            sink: sink.clone(),
            adapter_state: StateRelay::new(AdapterState::Unknown),
            registry: Mutex::new(Registry::default()),
            discovered: StateRelay::new(Vec::new()),
            connected: StateRelay::new(None),
            scanning: StateRelay::new(false),
            last_error: StateRelay::new(None),
            stale_events: AtomicU64::new(0),
        });

        let task = tokio::spawn(run_dispatch(core.clone(), events));
        adapter.set_event_sink(sink);
        tracing::info!("Session manager started");

        Self {
            _dispatcher: Arc::new(Dispatcher {
                core: core.clone(),
                task,
            }),
            core,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn adapter_state(&self) -> Observable<AdapterState> {
        self.core.adapter_state.subscribe()
    }

    /// Every device seen so far, one entry per identifier, in discovery order
    pub fn discovered_devices(&self) -> Observable<Vec<DeviceSession>> {
        self.core.discovered.subscribe()
    }

    pub fn connected_device(&self) -> Observable<Option<DeviceSession>> {
        self.core.connected.subscribe()
    }

    pub fn is_scanning(&self) -> Observable<bool> {
        self.core.scanning.subscribe()
    }

    /// Message of the most recent failed operation
    pub fn last_error(&self) -> Observable<Option<String>> {
        self.core.last_error.subscribe()
    }

    pub fn device(&self, id: &str) -> Option<DeviceSession> {
        self.core.device(id)
    }

    /// Resolve a cached characteristic through the device and service caches
    pub fn characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicSession, SessionError> {
        self.core.characteristic(device, service, characteristic)
    }

    /// Start scanning, optionally only for peripherals advertising `services`
    ///
    /// Repeated advertisements update the known device rather than adding a
    /// new entry.
    pub async fn start_scanning(&self, services: Option<Vec<Uuid>>) -> Result<(), SessionError> {
        self.core.start_scanning(services).await
    }

    /// Stop scanning; always succeeds
    pub async fn stop_scanning(&self) {
        self.core.stop_scanning().await
    }

    /// Connect to a discovered device
    ///
    /// Only one device is connected at a time: a connected device other than
    /// `id` is disconnected first, and a connect while another device is still
    /// connecting fails with [`SessionError::ConnectionInProgress`]. Concurrent
    /// calls for the same device share one attempt.
    pub async fn connect(&self, id: &str) -> Result<DeviceSession, SessionError> {
        self.core.connect(id).await
    }

    /// Disconnect a device; succeeds immediately if it is not connected
    pub async fn disconnect(&self, id: &str) -> Result<(), SessionError> {
        self.core.disconnect(id).await
    }

    /// Channel feeding the dispatch task, for backends wired up by hand
    pub fn event_sink(&self) -> EventSink {
        self.core.sink.clone()
    }

    pub fn stats(&self) -> ManagerStats {
        let core = &self.core;
        ManagerStats {
            known_devices: core.registry.lock().devices.len(),
            connected_device: core.connected.get().map(|device| device.id().to_string()),
            adapter_state: core.adapter_state.get(),
            scanning: core.scanning.get(),
            stale_events_dropped: core.stale_events.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("stats", &self.stats())
            .finish()
    }
}
