//! Device sessions
//!
//! One session per discovered peripheral. Tracks signal strength, the
//! connection state machine and the service cache, and routes GATT events down
//! to the owning service and characteristic.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::adapter::{AdapterError, CharacteristicDescriptor, DeviceId, ServiceDescriptor};
use super::characteristic::CharacteristicSession;
use super::manager::{self, Core};
use super::pending::Waiters;
use super::relay::{Observable, StateRelay};
use super::service::ServiceSession;
use super::SessionError;

/// Link state of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Inputs to the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    ConnectRequested,
    Connected,
    DisconnectRequested,
    /// The adapter refused to start a requested disconnect
    DisconnectRefused,
    Disconnected,
    ConnectFailed,
}

impl ConnectionState {
    /// Next state, or `None` when the transition is not allowed
    pub(crate) fn next(self, transition: Transition) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, transition) {
            (Disconnected, Transition::ConnectRequested) => Some(Connecting),
            (Connecting, Transition::Connected) => Some(Connected),
            (Connected, Transition::DisconnectRequested) => Some(Disconnecting),
            (Disconnecting, Transition::DisconnectRefused) => Some(Connected),
            (Connecting | Connected | Disconnecting, Transition::Disconnected) => Some(Disconnected),
            (Connecting | Connected | Disconnecting, Transition::ConnectFailed) => Some(Disconnected),
            _ => None,
        }
    }
}

/// Serializable snapshot of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
    pub state: ConnectionState,
    pub services: Vec<Uuid>,
    pub last_seen: DateTime<Utc>,
}

pub(crate) struct DeviceShared {
    core: Weak<Core>,
    id: DeviceId,
    name: RwLock<Option<String>>,
    last_seen: RwLock<DateTime<Utc>>,
    rssi: StateRelay<i16>,
    state: StateRelay<ConnectionState>,
    cache: Mutex<HashMap<Uuid, ServiceSession>>,
    services: StateRelay<Vec<ServiceSession>>,
    connects: Waiters<Result<(), SessionError>>,
    disconnects: Waiters<Result<(), AdapterError>>,
    discoveries: Waiters<Result<(), AdapterError>>,
}

/// Handle to one discovered peripheral
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<DeviceShared>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.shared.id)
            .field("name", &*self.shared.name.read())
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    pub(crate) fn new(core: Weak<Core>, id: DeviceId, name: Option<String>, rssi: i16) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                core,
                id,
                name: RwLock::new(name),
                last_seen: RwLock::new(Utc::now()),
                rssi: StateRelay::new(rssi),
                state: StateRelay::new(ConnectionState::Disconnected),
                cache: Mutex::new(HashMap::new()),
                services: StateRelay::new(Vec::new()),
                connects: Waiters::default(),
                disconnects: Waiters::default(),
                discoveries: Waiters::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn name(&self) -> Option<String> {
        self.shared.name.read().clone()
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.shared.last_seen.read()
    }

    /// Last known signal strength
    pub fn rssi(&self) -> Observable<i16> {
        self.shared.rssi.subscribe()
    }

    pub fn connection_state(&self) -> Observable<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Services in discovery order
    pub fn services(&self) -> Observable<Vec<ServiceSession>> {
        self.shared.services.subscribe()
    }

    pub fn service(&self, uuid: Uuid) -> Option<ServiceSession> {
        self.shared.cache.lock().get(&uuid).cloned()
    }

    pub fn require_service(&self, uuid: Uuid) -> Result<ServiceSession, SessionError> {
        self.service(uuid).ok_or_else(|| SessionError::UnknownService {
            device: self.shared.id.clone(),
            service: uuid,
        })
    }

    pub fn same_session(&self, other: &DeviceSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.shared.id.clone(),
            name: self.name(),
            rssi: self.shared.rssi.get(),
            state: self.state(),
            services: self.shared.services.get().iter().map(ServiceSession::uuid).collect(),
            last_seen: self.last_seen(),
        }
    }

    /// Connect through the owning manager; see [`SessionManager::connect`]
    ///
    /// [`SessionManager::connect`]: super::SessionManager::connect
    pub async fn connect(&self) -> Result<(), SessionError> {
        let core = manager::upgrade(&self.shared.core)?;
        core.connect(&self.shared.id).await.map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let core = manager::upgrade(&self.shared.core)?;
        core.disconnect(&self.shared.id).await
    }

    /// Discover services and resolve with the current service list
    ///
    /// Requires an established connection. Concurrent callers share one
    /// adapter command.
    pub async fn discover_services(&self) -> Result<Vec<ServiceSession>, SessionError> {
        let shared = &self.shared;
        let core = manager::upgrade(&shared.core)?;
        core.require_connected(&shared.id)?;

        let (pending, first) = shared.discoveries.register_shared();
        let id = pending.id();
        if first {
            tracing::info!(device = %shared.id, "discovering services");
            if let Err(e) = core.adapter().discover_services(&shared.id).await {
                shared.discoveries.resolve_all(Err(e));
            }
        }
        let limit = core.config().operation_timeout();
        drop(core);

        match pending.wait_timeout(limit, "service discovery").await {
            Ok(Ok(())) => Ok(shared.services.get()),
            Ok(Err(e)) => Err(manager::report(
                &shared.core,
                SessionError::from_adapter("service discovery", e),
            )),
            Err(e) => {
                shared.discoveries.withdraw(id);
                Err(manager::report(&shared.core, e))
            }
        }
    }

    pub(crate) fn connects(&self) -> &Waiters<Result<(), SessionError>> {
        &self.shared.connects
    }

    pub(crate) fn disconnects(&self) -> &Waiters<Result<(), AdapterError>> {
        &self.shared.disconnects
    }

    /// Drive the state machine; rejected transitions are logged and ignored
    pub(crate) fn transition(&self, transition: Transition) -> bool {
        let current = self.state();
        match current.next(transition) {
            Some(next) => {
                tracing::debug!(device = %self.shared.id, "{} -> {}", current, next);
                self.shared.state.set(next);
                true
            }
            None => {
                tracing::warn!(
                    device = %self.shared.id,
                    state = %current,
                    "rejected connection transition {:?}",
                    transition
                );
                false
            }
        }
    }

    /// Record a repeated advertisement
    pub(crate) fn seen(&self, name: Option<String>, rssi: i16) {
        *self.shared.last_seen.write() = Utc::now();
        self.shared.rssi.set_if_changed(rssi);
        if let Some(name) = name {
            let mut current = self.shared.name.write();
            if current.is_none() {
                tracing::debug!(device = %self.shared.id, "name resolved: {}", name);
                *current = Some(name);
            }
        }
    }

    /// Merge discovered services into the cache
    pub(crate) fn apply_services(
        &self,
        descriptors: &[ServiceDescriptor],
        error: Option<AdapterError>,
    ) {
        let shared = &self.shared;
        if let Some(e) = error {
            tracing::warn!(device = %shared.id, "service discovery failed: {}", e);
            shared.discoveries.resolve_all(Err(e));
            return;
        }

        let added = {
            let mut cache = shared.cache.lock();
            let mut added = Vec::new();
            for descriptor in descriptors {
                match cache.get(&descriptor.uuid) {
                    Some(existing) => existing.refresh(descriptor),
                    None => {
                        let service =
                            ServiceSession::new(shared.core.clone(), shared.id.clone(), descriptor);
                        cache.insert(descriptor.uuid, service.clone());
                        added.push(service);
                    }
                }
            }
            added
        };

        tracing::info!(
            device = %shared.id,
            reported = descriptors.len(),
            new = added.len(),
            "services discovered"
        );
        shared.services.update(|list| {
            list.extend(added);
            true
        });
        shared.discoveries.resolve_all(Ok(()));
    }

    /// Route a characteristic discovery result; `None` if the service is unknown
    pub(crate) fn route_characteristics(
        &self,
        service: Uuid,
        descriptors: &[CharacteristicDescriptor],
        error: Option<AdapterError>,
    ) -> Option<()> {
        let service = self.service(service)?;
        service.apply_characteristics(descriptors, error);
        Some(())
    }

    /// Resolve a cached characteristic for an incoming GATT event
    pub(crate) fn route(&self, service: Uuid, characteristic: Uuid) -> Option<CharacteristicSession> {
        self.service(service)?.characteristic(characteristic)
    }

    /// Fail outstanding GATT work on this device; caches are kept
    pub(crate) fn fail_pending(&self, error: &AdapterError) {
        self.shared.discoveries.resolve_all(Err(error.clone()));
        for service in self.shared.services.get() {
            service.fail_pending(error);
        }
    }
}
