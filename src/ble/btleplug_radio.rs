//! btleplug radio backend
//!
//! Drives the host Bluetooth stack through btleplug's central role. Central
//! events are translated into [`RadioEvent`]s by a background task. Each
//! connected peripheral gets a [`GattQueue`] that runs its GATT commands one at
//! a time, so issuing a command never waits on the radio and completions are
//! reported in the order the commands were issued.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::adapter::{
    AdapterError, AdapterState, CharacteristicDescriptor, CharacteristicProperties, DeviceId,
    EventSink, RadioAdapter, RadioEvent, ScanFilter, ServiceDescriptor, WriteMode,
};

type PeripheralTable = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;
type LinkTable = Arc<Mutex<HashMap<DeviceId, DeviceLink>>>;

/// A unit of GATT work; resolves with the event reporting its outcome, if any
type GattJob = BoxFuture<'static, Option<RadioEvent>>;

/// Serial executor for one peripheral's GATT commands
struct GattQueue {
    jobs: mpsc::UnboundedSender<GattJob>,
    worker: JoinHandle<()>,
}

impl GattQueue {
    fn spawn(device: DeviceId, sink: EventSink) -> Self {
        let (jobs, queued) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_gatt_queue(device, queued, sink));
        Self { jobs, worker }
    }

    fn submit<F>(&self, job: F) -> Result<(), AdapterError>
    where
        F: Future<Output = Option<RadioEvent>> + Send + 'static,
    {
        self.jobs
            .send(Box::pin(job))
            .map_err(|_| AdapterError::Disconnected)
    }
}

impl Drop for GattQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_gatt_queue(
    device: DeviceId,
    mut queued: mpsc::UnboundedReceiver<GattJob>,
    sink: EventSink,
) {
    while let Some(job) = queued.recv().await {
        if let Some(event) = job.await {
            emit(&sink, event);
        }
    }
    tracing::debug!(device = %device, "GATT queue closed");
}

/// Background work bound to one connection; dropped when the link goes down
struct DeviceLink {
    gatt: GattQueue,
    notifications: JoinHandle<()>,
}

impl DeviceLink {
    fn open(id: DeviceId, peripheral: Peripheral, sink: EventSink) -> Self {
        Self {
            gatt: GattQueue::spawn(id.clone(), sink.clone()),
            notifications: tokio::spawn(forward_notifications(id, peripheral, sink)),
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.notifications.abort();
    }
}

fn close_link(links: &LinkTable, device: &str) {
    if links.lock().remove(device).is_some() {
        tracing::debug!(device = %device, "Link tasks stopped");
    }
}

/// [`RadioAdapter`] over the first adapter btleplug reports
pub struct BtleplugRadio {
    adapter: Adapter,
    peripherals: PeripheralTable,
    links: LinkTable,
    sink: Mutex<Option<EventSink>>,
}

impl BtleplugRadio {
    pub async fn new() -> Result<Self, AdapterError> {
        tracing::info!("Initializing btleplug radio (central role)");
        let manager = Manager::new().await.map_err(platform)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform)?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Platform("no Bluetooth adapter found".to_string()))?;

        match adapter.adapter_info().await {
            Ok(info) => tracing::info!("📡 Using adapter: {}", info),
            Err(e) => tracing::debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
            sink: Mutex::new(None),
        })
    }

    fn sink(&self) -> Result<EventSink, AdapterError> {
        self.sink
            .lock()
            .clone()
            .ok_or_else(|| AdapterError::Platform("event sink not registered".to_string()))
    }

    async fn peripheral(&self, device: &str) -> Result<Peripheral, AdapterError> {
        self.peripherals
            .read()
            .await
            .get(device)
            .cloned()
            .ok_or_else(|| AdapterError::PeripheralNotFound(device.to_string()))
    }

    /// Queue GATT work behind everything already issued to `device`
    fn submit<F>(&self, device: &str, job: F) -> Result<(), AdapterError>
    where
        F: Future<Output = Option<RadioEvent>> + Send + 'static,
    {
        match self.links.lock().get(device) {
            Some(link) => link.gatt.submit(job),
            None => Err(AdapterError::Disconnected),
        }
    }
}

fn platform(error: btleplug::Error) -> AdapterError {
    match error {
        btleplug::Error::DeviceNotFound => AdapterError::PeripheralNotFound("unknown".to_string()),
        btleplug::Error::NotConnected => AdapterError::Disconnected,
        other => AdapterError::Platform(other.to_string()),
    }
}

fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    let mut properties = CharacteristicProperties::empty();
    for (flag, property) in [
        (CharPropFlags::READ, CharacteristicProperties::READ),
        (CharPropFlags::WRITE, CharacteristicProperties::WRITE),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ),
        (CharPropFlags::NOTIFY, CharacteristicProperties::NOTIFY),
        (CharPropFlags::INDICATE, CharacteristicProperties::INDICATE),
    ] {
        if flags.contains(flag) {
            properties |= property;
        }
    }
    properties
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic, AdapterError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic && c.service_uuid == service)
        .ok_or(AdapterError::CharacteristicNotFound(characteristic))
}

fn emit(sink: &EventSink, event: RadioEvent) {
    if sink.send(event).is_err() {
        tracing::debug!("Session manager gone, dropping radio event");
    }
}

/// Translate central events until the adapter's event stream ends
async fn run_central_events(
    adapter: Adapter,
    peripherals: PeripheralTable,
    links: LinkTable,
    sink: EventSink,
) {
    match adapter.adapter_state().await {
        Ok(state) => emit(&sink, RadioEvent::PowerStateChanged(adapter_state(state))),
        Err(e) => tracing::warn!("Could not read adapter state: {}", e),
    }

    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!("❌ Could not subscribe to adapter events: {}", e);
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        tracing::debug!("Discovered peripheral vanished: {}", e);
                        continue;
                    }
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let key = peripheral.id().to_string();
                peripherals.write().await.insert(key.clone(), peripheral);
                emit(
                    &sink,
                    RadioEvent::DeviceDiscovered {
                        id: key,
                        name: props.local_name,
                        rssi: props.rssi.unwrap_or(i16::MIN),
                    },
                );
            }
            CentralEvent::DeviceDisconnected(id) => {
                let id = id.to_string();
                close_link(&links, &id);
                emit(&sink, RadioEvent::Disconnected { id, error: None });
            }
            CentralEvent::StateUpdate(state) => {
                emit(&sink, RadioEvent::PowerStateChanged(adapter_state(state)))
            }
            _ => {}
        }
    }
    tracing::debug!("Adapter event stream ended");
}

/// Forward notifications of a connected peripheral as value events
async fn forward_notifications(id: DeviceId, peripheral: Peripheral, sink: EventSink) {
    let mut notifications = match peripheral.notifications().await {
        Ok(notifications) => notifications,
        Err(e) => {
            tracing::warn!(device = %id, "Notifications unavailable: {}", e);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        let service = peripheral
            .characteristics()
            .iter()
            .find(|c| c.uuid == notification.uuid)
            .map(|c| c.service_uuid);
        let Some(service) = service else {
            tracing::debug!(device = %id, "Notification for unknown characteristic {}", notification.uuid);
            continue;
        };
        emit(
            &sink,
            RadioEvent::ValueUpdated {
                id: id.clone(),
                service,
                characteristic: notification.uuid,
                value: Some(notification.value),
                error: None,
            },
        );
    }
}

#[async_trait]
impl RadioAdapter for BtleplugRadio {
    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink.clone());
        tokio::spawn(run_central_events(
            self.adapter.clone(),
            self.peripherals.clone(),
            self.links.clone(),
            sink,
        ));
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<(), AdapterError> {
        self.adapter
            .start_scan(BtleScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(platform)
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.adapter.stop_scan().await.map_err(platform)
    }

    async fn connect(&self, device: &str) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device).await?;
        let sink = self.sink()?;
        let id = device.to_string();
        let links = self.links.clone();
        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    let link = DeviceLink::open(id.clone(), peripheral, sink.clone());
                    if links.lock().insert(id.clone(), link).is_some() {
                        tracing::debug!(device = %id, "Replaced leftover link tasks");
                    }
                    emit(&sink, RadioEvent::Connected { id });
                }
                Err(e) => emit(
                    &sink,
                    RadioEvent::ConnectFailed {
                        id,
                        error: Some(platform(e)),
                    },
                ),
            }
        });
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device).await?;
        let sink = self.sink()?;
        close_link(&self.links, device);
        let id = device.to_string();
        tokio::spawn(async move {
            let error = peripheral.disconnect().await.err().map(platform);
            if let Some(e) = &error {
                tracing::warn!(device = %id, "Disconnect reported an error: {}", e);
            }
            emit(&sink, RadioEvent::Disconnected { id, error });
        });
        Ok(())
    }

    async fn discover_services(&self, device: &str) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device).await?;
        let id = device.to_string();
        self.submit(device, async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => RadioEvent::ServicesDiscovered {
                    id,
                    services: peripheral
                        .services()
                        .iter()
                        .map(|service| ServiceDescriptor {
                            uuid: service.uuid,
                            is_primary: service.primary,
                        })
                        .collect(),
                    error: None,
                },
                Err(e) => RadioEvent::ServicesDiscovered {
                    id,
                    services: Vec::new(),
                    error: Some(platform(e)),
                },
            };
            Some(event)
        })
    }

    async fn discover_characteristics(
        &self,
        device: &str,
        service: Uuid,
    ) -> Result<(), AdapterError> {
        // btleplug resolves characteristics together with services
        let peripheral = self.peripheral(device).await?;
        let id = device.to_string();
        self.submit(device, async move {
            let found = peripheral.services().into_iter().find(|s| s.uuid == service);
            let event = match found {
                Some(found) => RadioEvent::CharacteristicsDiscovered {
                    id,
                    service,
                    characteristics: found
                        .characteristics
                        .iter()
                        .map(|c| CharacteristicDescriptor::new(c.uuid, properties(c.properties)))
                        .collect(),
                    error: None,
                },
                None => RadioEvent::CharacteristicsDiscovered {
                    id,
                    service,
                    characteristics: Vec::new(),
                    error: Some(AdapterError::ServiceNotFound(service)),
                },
            };
            Some(event)
        })
    }

    async fn read_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device).await?;
        let target = find_characteristic(&peripheral, service, characteristic)?;
        let id = device.to_string();
        self.submit(device, async move {
            let (value, error) = match peripheral.read(&target).await {
                Ok(bytes) => (Some(bytes), None),
                Err(e) => (None, Some(platform(e))),
            };
            Some(RadioEvent::ValueUpdated {
                id,
                service,
                characteristic,
                value,
                error,
            })
        })
    }

    async fn write_characteristic(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device).await?;
        let target = find_characteristic(&peripheral, service, characteristic)?;
        let id = device.to_string();
        let data = data.to_vec();
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.submit(device, async move {
            let error = peripheral.write(&target, &data, write_type).await.err().map(platform);
            match mode {
                WriteMode::WithResponse => Some(RadioEvent::WriteCompleted {
                    id,
                    service,
                    characteristic,
                    error,
                }),
                WriteMode::WithoutResponse => {
                    if let Some(e) = error {
                        tracing::warn!(device = %id, characteristic = %characteristic, "Unacknowledged write failed: {}", e);
                    }
                    None
                }
            }
        })
    }

    async fn set_notify(
        &self,
        device: &str,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(device).await?;
        let target = find_characteristic(&peripheral, service, characteristic)?;
        let id = device.to_string();
        self.submit(device, async move {
            let result = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let error = result.err().map(platform);
            Some(RadioEvent::NotifyStateChanged {
                id,
                service,
                characteristic,
                is_notifying: enabled && error.is_none(),
                error,
            })
        })
    }
}
