//! Characteristic sessions
//!
//! Wraps one GATT characteristic of a connected peripheral. The cached value is
//! published as an observable; read, write and notify toggles are bridged from
//! the adapter's completion events.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::adapter::{
    AdapterError, CharacteristicDescriptor, CharacteristicProperties, DeviceId, WriteMode,
};
use super::manager::{self, Core};
use super::pending::{Delivery, Waiters};
use super::relay::{EventRelay, Observable, StateRelay, Updates};
use super::SessionError;

/// Serializable snapshot of a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicRecord {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub last_value: Option<Vec<u8>>,
    pub is_notifying: bool,
}

type ReadOutcome = Result<Option<Vec<u8>>, AdapterError>;
type WriteOutcome = Result<(), AdapterError>;

pub(crate) struct CharacteristicShared {
    core: Weak<Core>,
    device: DeviceId,
    service: Uuid,
    uuid: Uuid,
    properties: RwLock<CharacteristicProperties>,
    value: EventRelay<Option<Vec<u8>>>,
    notifying: StateRelay<bool>,
    reads: Waiters<ReadOutcome>,
    writes: Waiters<WriteOutcome>,
}

/// Handle to one cached characteristic
///
/// Clones share the same underlying session; rediscovery never replaces it, so
/// value subscriptions survive.
#[derive(Clone)]
pub struct CharacteristicSession {
    shared: Arc<CharacteristicShared>,
}

impl std::fmt::Debug for CharacteristicSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacteristicSession")
            .field("device", &self.shared.device)
            .field("service", &self.shared.service)
            .field("uuid", &self.shared.uuid)
            .field("properties", &self.properties())
            .finish()
    }
}

impl CharacteristicSession {
    pub(crate) fn new(
        core: Weak<Core>,
        device: DeviceId,
        service: Uuid,
        descriptor: &CharacteristicDescriptor,
    ) -> Self {
        Self {
            shared: Arc::new(CharacteristicShared {
                core,
                device,
                service,
                uuid: descriptor.uuid,
                properties: RwLock::new(descriptor.properties),
                value: EventRelay::new(descriptor.value.clone()),
                notifying: StateRelay::new(descriptor.is_notifying),
                reads: Waiters::default(),
                writes: Waiters::default(),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    pub fn service_uuid(&self) -> Uuid {
        self.shared.service
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device
    }

    pub fn properties(&self) -> CharacteristicProperties {
        *self.shared.properties.read()
    }

    /// Cached value, replayed to new subscribers, then every value event in order
    pub fn value(&self) -> Updates<Option<Vec<u8>>> {
        self.shared.value.subscribe()
    }

    pub fn is_notifying(&self) -> Observable<bool> {
        self.shared.notifying.subscribe()
    }

    /// Whether both handles refer to the same cached session
    pub fn same_session(&self, other: &CharacteristicSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn record(&self) -> CharacteristicRecord {
        CharacteristicRecord {
            uuid: self.shared.uuid,
            properties: self.properties(),
            last_value: self.shared.value.get(),
            is_notifying: self.shared.notifying.get(),
        }
    }

    /// Read the characteristic
    ///
    /// Resolves with the first value event after the read was issued; a value
    /// cached before the call is never returned.
    pub async fn read(&self) -> Result<Option<Vec<u8>>, SessionError> {
        let shared = &self.shared;
        let core = manager::upgrade(&shared.core)?;
        core.require_connected(&shared.device)?;

        let pending = shared.reads.register();
        let id = pending.id();
        if let Err(e) = core
            .adapter()
            .read_characteristic(&shared.device, shared.service, shared.uuid)
            .await
        {
            shared.reads.withdraw(id);
            return Err(core.report(SessionError::from_adapter("read", e)));
        }
        let limit = core.config().operation_timeout();
        drop(core);

        tracing::debug!(
            device = %shared.device,
            characteristic = %shared.uuid,
            "read issued"
        );
        // a timed-out read keeps its slot so the late reply cannot reach the next caller
        match pending.wait_timeout(limit, "read").await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(manager::report(&shared.core, SessionError::from_adapter("read", e))),
            Err(e) => Err(manager::report(&shared.core, e)),
        }
    }

    /// Write `data`
    ///
    /// With response, resolves once the peripheral acknowledges. Without
    /// response, resolves as soon as the command is issued.
    pub async fn write(&self, data: &[u8], mode: WriteMode) -> Result<(), SessionError> {
        let shared = &self.shared;
        let core = manager::upgrade(&shared.core)?;
        core.require_connected(&shared.device)?;

        if !self.properties().can_write(mode) {
            tracing::debug!(
                characteristic = %shared.uuid,
                properties = %self.properties(),
                "writing with {:?} to a characteristic that does not advertise it",
                mode
            );
        }

        let pending = match mode {
            WriteMode::WithResponse => Some(shared.writes.register()),
            WriteMode::WithoutResponse => None,
        };
        let issued = core
            .adapter()
            .write_characteristic(&shared.device, shared.service, shared.uuid, data, mode)
            .await;
        if let Err(e) = issued {
            if let Some(pending) = &pending {
                shared.writes.withdraw(pending.id());
            }
            return Err(core.report(SessionError::from_adapter("write", e)));
        }

        let Some(pending) = pending else {
            return Ok(());
        };
        let limit = core.config().operation_timeout();
        drop(core);

        match pending.wait_timeout(limit, "write").await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(manager::report(&shared.core, SessionError::from_adapter("write", e))),
            Err(e) => Err(manager::report(&shared.core, e)),
        }
    }

    /// Toggle notifications
    ///
    /// Resolves once the command is issued; [`is_notifying`](Self::is_notifying)
    /// follows the adapter's confirmation events.
    pub async fn set_notify(&self, enabled: bool) -> Result<(), SessionError> {
        let shared = &self.shared;
        let core = manager::upgrade(&shared.core)?;
        core.require_connected(&shared.device)?;

        core.adapter()
            .set_notify(&shared.device, shared.service, shared.uuid, enabled)
            .await
            .map_err(|e| core.report(SessionError::from_adapter("set notify", e)))
    }

    pub(crate) fn refresh(&self, descriptor: &CharacteristicDescriptor) {
        *self.shared.properties.write() = descriptor.properties;
    }

    /// Apply a value event; a failed read keeps the cached value
    pub(crate) fn apply_value(
        &self,
        value: Option<Vec<u8>>,
        error: Option<AdapterError>,
    ) -> Delivery {
        let shared = &self.shared;
        let outcome = match error {
            Some(e) => {
                tracing::warn!(characteristic = %shared.uuid, "value update failed: {}", e);
                Err(e)
            }
            None => {
                if let Some(bytes) = &value {
                    shared.value.publish(Some(bytes.clone()));
                }
                Ok(value)
            }
        };
        shared.reads.resolve_next(outcome)
    }

    pub(crate) fn apply_write_complete(&self, error: Option<AdapterError>) -> Delivery {
        self.shared.writes.resolve_next(error.map_or(Ok(()), Err))
    }

    pub(crate) fn apply_notify_state(&self, is_notifying: bool, error: Option<AdapterError>) {
        match error {
            Some(e) => tracing::warn!(
                characteristic = %self.shared.uuid,
                "notify state change failed: {}",
                e
            ),
            None => {
                self.shared.notifying.set_if_changed(is_notifying);
            }
        }
    }

    /// Fail every outstanding read and write
    pub(crate) fn fail_pending(&self, error: &AdapterError) {
        self.shared.reads.resolve_all(Err(error.clone()));
        self.shared.writes.resolve_all(Err(error.clone()));
        self.shared.notifying.set_if_changed(false);
    }
}
