//! Platform-agnostic radio adapter interface
//!
//! This module defines the command surface the session layer drives and the
//! events a radio backend pushes back. Backends (btleplug, the in-memory mock)
//! implement [`RadioAdapter`] and deliver every outcome as a [`RadioEvent`]
//! through the sink handed to them by the session manager.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stable platform identifier of a peripheral
pub type DeviceId = String;

/// Channel through which a backend pushes events into the session manager
pub type EventSink = mpsc::UnboundedSender<RadioEvent>;

/// Power/authorization state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Scan and connect commands are only valid in this state
    pub fn is_ready(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::Resetting => "resetting",
            AdapterState::Unsupported => "unsupported",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::PoweredOff => "powered off",
            AdapterState::PoweredOn => "powered on",
        };
        f.write_str(name)
    }
}

/// GATT write flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    /// Peripheral acknowledges the write; completion arrives as `WriteCompleted`
    WithResponse,
    /// No acknowledgement exists at the protocol level
    WithoutResponse,
}

/// Characteristic property bit-set (values follow the GATT declaration bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    const NAMED: [(Self, &'static str); 5] = [
        (Self::READ, "read"),
        (Self::WRITE_WITHOUT_RESPONSE, "writeWithoutResponse"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Keeps only the bits this crate knows about
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0x3e)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.contains(Self::WRITE),
            WriteMode::WithoutResponse => self.contains(Self::WRITE_WITHOUT_RESPONSE),
        }
    }

    /// Notify or indicate
    pub fn can_subscribe(self) -> bool {
        self.0 & (Self::NOTIFY.0 | Self::INDICATE.0) != 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join("|"))
    }
}

/// Scan parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services (empty = all)
    pub services: Vec<Uuid>,
    /// Whether repeated advertisements are reported as separate discoveries
    pub allow_duplicates: bool,
}

/// A service as reported by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub is_primary: bool,
}

/// A characteristic as reported by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Value already known to the stack at discovery time, if any
    pub value: Option<Vec<u8>>,
    pub is_notifying: bool,
}

impl CharacteristicDescriptor {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            value: None,
            is_notifying: false,
        }
    }
}

/// Explicit failures surfaced by the radio for an attempted operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("peripheral not found: {0}")]
    PeripheralNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("link lost")]
    LinkLost,

    #[error("peripheral disconnected before the operation completed")]
    Disconnected,

    #[error("platform error: {0}")]
    Platform(String),
}

/// Events pushed by a radio backend, delivered serially to the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    PowerStateChanged(AdapterState),
    DeviceDiscovered {
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
    },
    Connected {
        id: DeviceId,
    },
    Disconnected {
        id: DeviceId,
        error: Option<AdapterError>,
    },
    ConnectFailed {
        id: DeviceId,
        error: Option<AdapterError>,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<ServiceDescriptor>,
        error: Option<AdapterError>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        characteristics: Vec<CharacteristicDescriptor>,
        error: Option<AdapterError>,
    },
    ValueUpdated {
        id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        error: Option<AdapterError>,
    },
    WriteCompleted {
        id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        error: Option<AdapterError>,
    },
    NotifyStateChanged {
        id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        is_notifying: bool,
        error: Option<AdapterError>,
    },
}

impl RadioEvent {
    /// Device the event belongs to; `None` for bare adapter state events
    pub fn device_id(&self) -> Option<&str> {
        match self {
            RadioEvent::PowerStateChanged(_) => None,
            RadioEvent::DeviceDiscovered { id, .. }
            | RadioEvent::Connected { id }
            | RadioEvent::Disconnected { id, .. }
            | RadioEvent::ConnectFailed { id, .. }
            | RadioEvent::ServicesDiscovered { id, .. }
            | RadioEvent::CharacteristicsDiscovered { id, .. }
            | RadioEvent::ValueUpdated { id, .. }
            | RadioEvent::WriteCompleted { id, .. }
            | RadioEvent::NotifyStateChanged { id, .. } => Some(id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RadioEvent::PowerStateChanged(_) => "power-state-changed",
            RadioEvent::DeviceDiscovered { .. } => "device-discovered",
            RadioEvent::Connected { .. } => "connected",
            RadioEvent::Disconnected { .. } => "disconnected",
            RadioEvent::ConnectFailed { .. } => "connect-failed",
            RadioEvent::ServicesDiscovered { .. } => "services-discovered",
            RadioEvent::CharacteristicsDiscovered { .. } => "characteristics-discovered",
            RadioEvent::ValueUpdated { .. } => "value-updated",
            RadioEvent::WriteCompleted { .. } => "write-completed",
            RadioEvent::NotifyStateChanged { .. } => "notify-state-changed",
        }
    }
}

/// Radio backend driven by the session manager
///
/// Every command only *issues* work: an `Err` means the adapter refused to
/// start the operation, while its outcome is always reported later as a
/// [`RadioEvent`] on the sink registered through [`set_event_sink`].
///
/// [`set_event_sink`]: RadioAdapter::set_event_sink
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Register the channel that receives power-state and peripheral events
    ///
    /// Called once by the session manager before any command is issued.
    /// Backends should report their current power state right away.
    fn set_event_sink(&self, sink: EventSink);

    /// Start scanning
    ///
    /// # Arguments
    /// * `filter` - Service filter and duplicate-reporting policy
    async fn scan(&self, filter: &ScanFilter) -> Result<(), AdapterError>;

    /// Stop scanning; idempotent
    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Begin connecting; outcome arrives as `Connected` or `ConnectFailed`
    async fn connect(&self, device: &str) -> Result<(), AdapterError>;

    /// Tear down (or cancel a pending) connection; outcome arrives as `Disconnected`
    async fn disconnect(&self, device: &str) -> Result<(), AdapterError>;

    /// Outcome arrives as `ServicesDiscovered`
    async fn discover_services(&self, device: &str) -> Result<(), AdapterError>;

    /// Outcome arrives as `CharacteristicsDiscovered` for `service`
    async fn discover_characteristics(&self, device: &str, service: Uuid)
        -> Result<(), AdapterError>;

    /// Outcome arrives as `ValueUpdated`
    async fn read_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), AdapterError>;

    /// Write a value
    ///
    /// # Arguments
    /// * `data` - Bytes to write
    /// * `mode` - With response: outcome arrives as `WriteCompleted`.
    ///   Without response: no event follows.
    async fn write_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError>;

    /// Toggle notifications; the stack may confirm with `NotifyStateChanged`
    async fn set_notify(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), AdapterError>;
}
