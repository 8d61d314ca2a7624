//! Reactive BLE central session layer
//!
//! Radio events flow one way: a [`RadioAdapter`] backend pushes [`RadioEvent`]s
//! into a single channel, the [`SessionManager`] drains it serially and routes
//! each event down to the owning device, service and characteristic session.
//! Every session republishes its state as an [`Observable`].
//!
//! Commands flow the other way and end in exactly one adapter call each.

pub mod adapter;
pub mod characteristic;
pub mod device;
pub mod manager;
pub mod mock;
pub mod relay;
pub mod service;

mod pending;

#[cfg(feature = "ble")]
pub mod btleplug_radio;

pub use adapter::{
    AdapterError, AdapterState, CharacteristicDescriptor, CharacteristicProperties, DeviceId,
    EventSink, RadioAdapter, RadioEvent, ScanFilter, ServiceDescriptor, WriteMode,
};
pub use characteristic::{CharacteristicRecord, CharacteristicSession};
pub use device::{ConnectionState, DeviceRecord, DeviceSession};
pub use manager::{ManagerStats, SessionManager};
pub use mock::{MockRadio, RadioCommand};
pub use relay::{Observable, SourceClosed, Updates};
pub use service::{ServiceRecord, ServiceSession};

#[cfg(feature = "ble")]
pub use btleplug_radio::BtleplugRadio;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to callers of session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("adapter not ready (state: {0})")]
    AdapterNotReady(AdapterState),

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("unknown service {service} on device {device}")]
    UnknownService { device: DeviceId, service: Uuid },

    #[error("unknown characteristic {characteristic} in service {service}")]
    UnknownCharacteristic { service: Uuid, characteristic: Uuid },

    #[error("no connection available")]
    SessionNotAvailable,

    #[error("{0} timed out")]
    OperationTimedOut(&'static str),

    #[error("{operation} rejected by adapter: {source}")]
    TransportRejected {
        operation: &'static str,
        source: AdapterError,
    },

    #[error("connection to {0} already in progress")]
    ConnectionInProgress(DeviceId),

    #[error("cannot {operation} device {device} while {state}")]
    InvalidState {
        device: DeviceId,
        operation: &'static str,
        state: ConnectionState,
    },
}

impl SessionError {
    /// Map an adapter failure reported for `operation`
    ///
    /// A link that dropped while the operation was outstanding means there is
    /// no longer a session to complete it on.
    pub fn from_adapter(operation: &'static str, error: AdapterError) -> Self {
        match error {
            AdapterError::Disconnected => SessionError::SessionNotAvailable,
            source => SessionError::TransportRejected { operation, source },
        }
    }
}

/// Create the platform radio backend
#[cfg(feature = "ble")]
pub async fn create_radio_adapter() -> Result<std::sync::Arc<dyn RadioAdapter>, AdapterError> {
    tracing::info!("Creating btleplug radio adapter");
    let radio = BtleplugRadio::new().await?;
    Ok(std::sync::Arc::new(radio))
}
