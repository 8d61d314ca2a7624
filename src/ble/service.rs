//! Service sessions
//!
//! Owns the characteristic cache of one GATT service and bridges
//! characteristic discovery completion.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::adapter::{AdapterError, CharacteristicDescriptor, DeviceId, ServiceDescriptor};
use super::characteristic::{CharacteristicRecord, CharacteristicSession};
use super::manager::{self, Core};
use super::pending::Waiters;
use super::relay::{Observable, StateRelay};
use super::SessionError;

/// Serializable snapshot of a service and its characteristics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristics: Vec<CharacteristicRecord>,
}

pub(crate) struct ServiceShared {
    core: Weak<Core>,
    device: DeviceId,
    uuid: Uuid,
    is_primary: Mutex<bool>,
    cache: Mutex<HashMap<Uuid, CharacteristicSession>>,
    characteristics: StateRelay<Vec<CharacteristicSession>>,
    discoveries: Waiters<Result<(), AdapterError>>,
}

/// Handle to one cached service
#[derive(Clone)]
pub struct ServiceSession {
    shared: Arc<ServiceShared>,
}

impl std::fmt::Debug for ServiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSession")
            .field("device", &self.shared.device)
            .field("uuid", &self.shared.uuid)
            .field("characteristics", &self.shared.cache.lock().len())
            .finish()
    }
}

impl ServiceSession {
    pub(crate) fn new(core: Weak<Core>, device: DeviceId, descriptor: &ServiceDescriptor) -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                core,
                device,
                uuid: descriptor.uuid,
                is_primary: Mutex::new(descriptor.is_primary),
                cache: Mutex::new(HashMap::new()),
                characteristics: StateRelay::new(Vec::new()),
                discoveries: Waiters::default(),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device
    }

    pub fn is_primary(&self) -> bool {
        *self.shared.is_primary.lock()
    }

    /// Characteristics in discovery order
    pub fn characteristics(&self) -> Observable<Vec<CharacteristicSession>> {
        self.shared.characteristics.subscribe()
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<CharacteristicSession> {
        self.shared.cache.lock().get(&uuid).cloned()
    }

    pub fn require_characteristic(&self, uuid: Uuid) -> Result<CharacteristicSession, SessionError> {
        self.characteristic(uuid)
            .ok_or(SessionError::UnknownCharacteristic {
                service: self.shared.uuid,
                characteristic: uuid,
            })
    }

    pub fn same_session(&self, other: &ServiceSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn record(&self) -> ServiceRecord {
        ServiceRecord {
            uuid: self.shared.uuid,
            is_primary: self.is_primary(),
            characteristics: self
                .shared
                .characteristics
                .get()
                .iter()
                .map(CharacteristicSession::record)
                .collect(),
        }
    }

    /// Discover the characteristics of this service
    ///
    /// Concurrent callers share one adapter command and resolve from the same
    /// completion event.
    pub async fn discover_characteristics(&self) -> Result<Vec<CharacteristicSession>, SessionError> {
        let shared = &self.shared;
        let core = manager::upgrade(&shared.core)?;
        core.require_connected(&shared.device)?;

        let (pending, first) = shared.discoveries.register_shared();
        let id = pending.id();
        if first {
            tracing::debug!(device = %shared.device, service = %shared.uuid, "discovering characteristics");
            if let Err(e) = core
                .adapter()
                .discover_characteristics(&shared.device, shared.uuid)
                .await
            {
                shared.discoveries.resolve_all(Err(e));
            }
        }
        let limit = core.config().operation_timeout();
        drop(core);

        match pending.wait_timeout(limit, "characteristic discovery").await {
            Ok(Ok(())) => Ok(shared.characteristics.get()),
            Ok(Err(e)) => Err(manager::report(
                &shared.core,
                SessionError::from_adapter("characteristic discovery", e),
            )),
            Err(e) => {
                shared.discoveries.withdraw(id);
                Err(manager::report(&shared.core, e))
            }
        }
    }

    pub(crate) fn refresh(&self, descriptor: &ServiceDescriptor) {
        *self.shared.is_primary.lock() = descriptor.is_primary;
    }

    /// Merge discovered characteristics into the cache
    ///
    /// Known identifiers keep their session; new ones are appended in the
    /// order reported.
    pub(crate) fn apply_characteristics(
        &self,
        descriptors: &[CharacteristicDescriptor],
        error: Option<AdapterError>,
    ) {
        let shared = &self.shared;
        if let Some(e) = error {
            tracing::warn!(service = %shared.uuid, "characteristic discovery failed: {}", e);
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
                        let characteristic = CharacteristicSession::new(
                            shared.core.clone(),
                            shared.device.clone(),
                            shared.uuid,
                            descriptor,
                        );
                        cache.insert(descriptor.uuid, characteristic.clone());
                        added.push(characteristic);
                    }
                }
            }
            added
        };

        tracing::debug!(
            service = %shared.uuid,
            reported = descriptors.len(),
            new = added.len(),
            "characteristics discovered"
        );
        shared.characteristics.update(|list| {
            list.extend(added);
            true
        });
        shared.discoveries.resolve_all(Ok(()));
    }

    /// Fail outstanding discovery and every characteristic operation
    pub(crate) fn fail_pending(&self, error: &AdapterError) {
        self.shared.discoveries.resolve_all(Err(error.clone()));
        for characteristic in self.shared.characteristics.get() {
            characteristic.fail_pending(error);
        }
    }
}
